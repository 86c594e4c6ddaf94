//! # yurt-vm
//!
//! Exposes services of the yurt VirtualBox guest on the host through NAT
//! port forwarding.
//!
//! ## Quick Start
//!
//! ```no_run
//! use yurt_core::{AppPaths, ConfigStore, ProcessExecutor};
//! use yurt_vm::{Negotiator, PortForwarding, Service, SshProbe, VBoxManage};
//!
//! # async fn example() -> yurt_vm::Result<()> {
//! let paths = AppPaths::from_env()?;
//! let executor = ProcessExecutor::new();
//!
//! let vbox = VBoxManage::locate(executor.clone());
//! let mut forwarding = PortForwarding::new(
//!     Negotiator::new(vbox),
//!     ConfigStore::open(paths.config_file()),
//! );
//!
//! let probe = SshProbe::new(
//!     executor,
//!     "yurt",
//!     paths.ssh_private_key_file(),
//!     paths.known_hosts_file(),
//! );
//! let port = forwarding.expose(Service::Ssh, &probe).await?;
//! println!("ssh -p {port} yurt@localhost");
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **NAT Control**: Add and remove named VirtualBox `natpf` rules
//! - **Negotiation**: Verified host ports with bounded random reselection
//! - **Probes**: SSH login and TCP reachability checks
//! - **Persistence**: Negotiated ports stored for the next session

mod error;
mod forward;
mod nat;
mod negotiate;
mod probe;

pub use error::{Result, VmError};
pub use forward::{PortForwarding, Service, LXD_GUEST_PORT, SSH_GUEST_PORT};
pub use nat::{NatControl, NatRule, VBoxManage};
pub use negotiate::{
    ForwardRequest, Negotiator, NegotiatorConfig, Phase, PortPicker, RandomPorts,
    DEFAULT_PORT_RANGE,
};
pub use probe::{Probe, SshProbe, TcpProbe};
