//! NAT port-forwarding rules in the hypervisor.
//!
//! [`NatControl`] is the only hypervisor surface the negotiator needs.
//! [`VBoxManage`] implements it by shelling out to VirtualBox's CLI
//! through an [`Executor`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use yurt_core::{CommandSpec, CoreError, Executor, ProcessExecutor, Result};

/// Deadline for a single `VBoxManage` invocation.
const VBOXMANAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// NAT adapter the forwarding rules are attached to.
const NAT_ADAPTER: &str = "natpf1";

/// Named host-to-guest TCP port mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Rule name, unique per VM (e.g. `ssh`).
    pub name: String,
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the guest.
    pub guest_port: u16,
}

impl NatRule {
    /// Create a rule mapping `host_port` to `guest_port`.
    pub fn new(name: impl Into<String>, host_port: u16, guest_port: u16) -> Self {
        Self {
            name: name.into(),
            host_port,
            guest_port,
        }
    }

    /// Rule in VirtualBox `natpf` syntax: `name,proto,host-ip,host-port,guest-ip,guest-port`.
    pub fn to_natpf(&self) -> String {
        format!("{},tcp,,{},,{}", self.name, self.host_port, self.guest_port)
    }
}

/// Adds and removes NAT forwarding rules on a VM.
#[async_trait]
pub trait NatControl: Send + Sync {
    /// Install `rule` on `vm`.
    async fn add_rule(&self, vm: &str, rule: &NatRule) -> Result<()>;

    /// Remove the rule called `name` from `vm`.
    ///
    /// Returns `false` when there was no such rule.
    async fn remove_rule(&self, vm: &str, name: &str) -> Result<bool>;
}

/// Handle on the VirtualBox command-line interface.
///
/// Constructed once per session and passed to whatever needs the hypervisor.
#[derive(Debug, Clone)]
pub struct VBoxManage<E: Executor = ProcessExecutor> {
    executable: PathBuf,
    executor: E,
    timeout: Duration,
}

impl<E: Executor> VBoxManage<E> {
    /// Use the given `VBoxManage` binary.
    pub fn new(executable: impl Into<PathBuf>, executor: E) -> Self {
        Self {
            executable: executable.into(),
            executor,
            timeout: VBOXMANAGE_TIMEOUT,
        }
    }

    /// Find `VBoxManage` in the usual install locations, falling back to `PATH`.
    pub fn locate(executor: E) -> Self {
        let executable = find_executable(&install_dirs()).unwrap_or_else(|| {
            tracing::debug!("VBoxManage not found in install directories, using PATH");
            PathBuf::from(executable_name())
        });
        tracing::debug!(path = %executable.display(), "Using VBoxManage");
        Self::new(executable, executor)
    }

    /// Override the per-command deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a quiet `VBoxManage` invocation.
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.executable.to_string_lossy())
            .arg("-q")
            .args(args)
            .timeout(self.timeout)
    }

    /// Run a `VBoxManage` subcommand and return its stdout.
    pub async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executor.execute(&self.command(args)).await
    }
}

#[async_trait]
impl<E: Executor> NatControl for VBoxManage<E> {
    async fn add_rule(&self, vm: &str, rule: &NatRule) -> Result<()> {
        tracing::debug!(vm, rule = %rule.name, host_port = rule.host_port, guest_port = rule.guest_port, "Adding NAT rule");
        let natpf = rule.to_natpf();
        self.run(["controlvm", vm, NAT_ADAPTER, natpf.as_str()])
            .await
            .map(|_| ())
    }

    async fn remove_rule(&self, vm: &str, name: &str) -> Result<bool> {
        match self.run(["controlvm", vm, NAT_ADAPTER, "delete", name]).await {
            Ok(_) => Ok(true),
            Err(CoreError::ProcessFailed { .. }) => {
                tracing::debug!(vm, rule = name, "No NAT rule to remove");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn executable_name() -> &'static str {
    if cfg!(windows) {
        "VBoxManage.exe"
    } else {
        "VBoxManage"
    }
}

/// Directories that may hold `VBoxManage`, most specific first.
fn install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    for var in ["VBOX_INSTALL_PATH", "VBOX_MSI_INSTALL_PATH"] {
        if let Ok(value) = std::env::var(var) {
            dirs.extend(
                value
                    .split(';')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| PathBuf::from(s.trim())),
            );
        }
    }

    if cfg!(windows) {
        if let Ok(drive) = std::env::var("SYSTEMDRIVE") {
            let drive = format!("{drive}\\");
            dirs.push(Path::new(&drive).join("Program Files").join("Oracle").join("VirtualBox"));
            dirs.push(
                Path::new(&drive)
                    .join("Program Files (x86)")
                    .join("Oracle")
                    .join("VirtualBox"),
            );
        }
        if let Ok(program_files) = std::env::var("PROGRAMFILES") {
            dirs.push(Path::new(&program_files).join("Oracle").join("VirtualBox"));
        }
    }

    dirs
}

fn find_executable(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(executable_name()))
        .find(|path| path.is_file())
}
