//! Error types for yurt-vm.

use thiserror::Error;
use yurt_core::{CoreError, Key};

/// Result type alias for yurt-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while exposing guest services on the host.
#[derive(Debug, Error)]
pub enum VmError {
    /// Error from yurt-core (process execution, config persistence)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The hypervisor refused to change the NAT table
    #[error("failed to set up port forwarding {rule}: {message}")]
    Negotiation {
        /// Forwarding rule name
        rule: String,
        /// What went wrong
        message: String,
    },

    /// No host port produced a reachable service within the attempt budget
    #[error(
        "set up port forwarding {rule} on host port {port} but the service in the guest \
         does not appear to be available after {attempts} attempts"
    )]
    NegotiationExhausted {
        /// Forwarding rule name
        rule: String,
        /// Last host port tried
        port: u16,
        /// Attempts made
        attempts: u32,
    },

    /// A config entry needed for the operation is not set
    #[error("config entry {0} is not set")]
    MissingConfig(Key),

    /// Negotiator configuration is unusable
    #[error("configuration error: {0}")]
    Config(String),

    /// Negotiation stopped by a manual interrupt
    #[error("port forwarding {rule} interrupted")]
    Interrupted {
        /// Forwarding rule name
        rule: String,
    },
}

impl VmError {
    /// Whether the work was stopped by a manual interrupt, here or in a command.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted { .. } => true,
            Self::Core(e) => e.is_interrupted(),
            _ => false,
        }
    }
}
