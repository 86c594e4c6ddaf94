//! Exposing guest services on the host and remembering where.

use crate::error::{Result, VmError};
use crate::nat::NatControl;
use crate::negotiate::{ForwardRequest, Negotiator, PortPicker, RandomPorts};
use crate::probe::Probe;
use std::fmt;
use yurt_core::{ConfigBackend, ConfigStore, JsonFile, Key};

/// SSH port inside the guest.
pub const SSH_GUEST_PORT: u16 = 22;

/// Container-management (LXD) API port inside the guest.
pub const LXD_GUEST_PORT: u16 = 8443;

/// Guest services forwarded to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Ssh,
    Lxd,
}

impl Service {
    /// NAT rule name.
    pub fn rule_name(&self) -> &'static str {
        match self {
            Service::Ssh => "ssh",
            Service::Lxd => "lxd",
        }
    }

    /// Port the service listens on in the guest.
    pub fn guest_port(&self) -> u16 {
        match self {
            Service::Ssh => SSH_GUEST_PORT,
            Service::Lxd => LXD_GUEST_PORT,
        }
    }

    /// Config entry holding the negotiated host port.
    pub fn config_key(&self) -> Key {
        match self {
            Service::Ssh => Key::SshPort,
            Service::Lxd => Key::LxdPort,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule_name())
    }
}

/// Ties a [`Negotiator`] to the config entries it reads and updates.
pub struct PortForwarding<N: NatControl, R: PortPicker = RandomPorts, B: ConfigBackend = JsonFile> {
    negotiator: Negotiator<N, R>,
    store: ConfigStore<B>,
}

impl<N: NatControl, R: PortPicker, B: ConfigBackend> PortForwarding<N, R, B> {
    /// Combine a negotiator with the config store it persists to.
    pub fn new(negotiator: Negotiator<N, R>, store: ConfigStore<B>) -> Self {
        Self { negotiator, store }
    }

    /// The negotiator in use.
    pub fn negotiator(&self) -> &Negotiator<N, R> {
        &self.negotiator
    }

    /// The config store in use.
    pub fn store(&self) -> &ConfigStore<B> {
        &self.store
    }

    /// Host port last stored for `service`, if it parses.
    pub fn remembered_port(&self, service: Service) -> Result<Option<u16>> {
        let key = service.config_key();
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        match raw.trim().parse::<u16>() {
            Ok(port) => Ok(Some(port)),
            Err(_) => {
                tracing::warn!(%key, value = %raw, "Ignoring unparsable stored port");
                Ok(None)
            }
        }
    }

    /// Forward `service` to a verified host port and store the port.
    ///
    /// # Errors
    ///
    /// [`VmError::MissingConfig`] if no VM name is stored, plus anything
    /// [`Negotiator::negotiate`] or [`ConfigStore::set`] returns.
    pub async fn expose<P: Probe + ?Sized>(&mut self, service: Service, probe: &P) -> Result<u16> {
        let vm = self
            .store
            .get(Key::VmName)?
            .ok_or(VmError::MissingConfig(Key::VmName))?;

        let request = ForwardRequest::new(vm, service.rule_name(), service.guest_port())
            .with_host_port(self.remembered_port(service)?);

        let port = self.negotiator.negotiate(&request, probe).await?;
        self.store.set(service.config_key(), port.to_string())?;

        tracing::info!(%service, host_port = port, "Service forwarded");
        Ok(port)
    }
}
