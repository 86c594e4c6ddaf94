//! Reachability probes for forwarded guest services.

use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use yurt_core::{CommandSpec, CoreError, Executor, ProcessExecutor};

/// Default deadline for a TCP connect probe.
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default deadline for the SSH handshake probe.
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Verdict on whether a service answers on a host port.
///
/// Implementations bound their own running time and never fail; anything
/// that goes wrong is an unreachable service.
#[async_trait]
pub trait Probe: Send + Sync {
    /// `true` if the service is reachable on `port`.
    async fn probe(&self, port: u16) -> bool;
}

/// Transport-level check: a TCP connection can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: IpAddr,
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout: TCP_PROBE_TIMEOUT,
        }
    }
}

impl TcpProbe {
    /// Probe `127.0.0.1` with the default deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the connect deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.host, port);
        tracing::debug!(%addr, "Trying TCP connect");

        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "Service not available");
                false
            }
            Err(_) => {
                tracing::debug!(%addr, timeout_ms = self.timeout.as_millis() as u64, "TCP probe timed out");
                false
            }
        }
    }
}

/// Full SSH login check using the system `ssh` client.
///
/// Host keys are trusted on first use and kept in a dedicated
/// known-hosts file, which is created empty when missing.
#[derive(Debug, Clone)]
pub struct SshProbe<E: Executor = ProcessExecutor> {
    executor: E,
    user: String,
    private_key: PathBuf,
    known_hosts: PathBuf,
    timeout: Duration,
}

impl<E: Executor> SshProbe<E> {
    /// Probe logging in as `user` with `private_key`, trusting hosts in `known_hosts`.
    pub fn new(
        executor: E,
        user: impl Into<String>,
        private_key: impl Into<PathBuf>,
        known_hosts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            user: user.into(),
            private_key: private_key.into(),
            known_hosts: known_hosts.into(),
            timeout: SSH_PROBE_TIMEOUT,
        }
    }

    /// Override the handshake deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host-key store used by the probe.
    pub fn known_hosts(&self) -> &Path {
        &self.known_hosts
    }

    /// `ssh` invocation that logs in on `port` and exits immediately.
    pub fn command(&self, port: u16) -> CommandSpec {
        let connect_timeout = self.timeout.as_secs().max(1);
        CommandSpec::new("ssh")
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("UserKnownHostsFile={}", self.known_hosts.display()))
            .args(["-o", "IdentitiesOnly=yes"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_timeout}"))
            .arg("-i")
            .arg(self.private_key.to_string_lossy())
            .arg("-p")
            .arg(port.to_string())
            .arg(format!("{}@localhost", self.user))
            .arg("true")
            .timeout(self.timeout + Duration::from_secs(5))
    }

    fn ensure_known_hosts(&self) -> io::Result<()> {
        if let Some(dir) = self.known_hosts.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.known_hosts)
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<E: Executor> Probe for SshProbe<E> {
    async fn probe(&self, port: u16) -> bool {
        if let Err(e) = self.ensure_known_hosts() {
            tracing::error!(path = %self.known_hosts.display(), error = %e, "Cannot create SSH host key store");
            return false;
        }

        tracing::debug!(port, "Trying SSH");
        match self.executor.execute(&self.command(port)).await {
            Ok(_) => true,
            Err(CoreError::ProcessTimedOut { .. }) => {
                tracing::error!(port, "SSH probe timed out");
                false
            }
            Err(CoreError::Interrupted { .. }) => {
                tracing::debug!(port, "SSH probe interrupted");
                false
            }
            Err(e) => {
                tracing::debug!(port, error = %e, "SSH not available");
                false
            }
        }
    }
}
