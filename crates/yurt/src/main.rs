//! yurt entry point.
//!
//! Forwards the guest's SSH and LXD ports to verified host ports and prints
//! where they ended up. Results go to stdout, logs to stderr. Ctrl-C stops
//! whatever step is running and exits with status 130.

mod settings;

use settings::Settings;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use yurt_core::{ConfigStore, Interrupt, ProcessExecutor};
use yurt_vm::{
    Negotiator, NegotiatorConfig, PortForwarding, Service, SshProbe, TcpProbe, VBoxManage,
    VmError,
};

/// Exit status after a manual interrupt (128 + SIGINT).
const INTERRUPTED_EXIT: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("yurt=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = Settings::from_env()?;
    tracing::debug!(?settings, "Settings loaded");

    let interrupt = Interrupt::on_ctrl_c();

    match forward_services(&settings, interrupt).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => match interrupted_exit(&e) {
            Some(code) => {
                tracing::warn!(error = %e, "Aborted");
                Ok(ExitCode::from(code))
            }
            None => Err(e.into()),
        },
    }
}

async fn forward_services(settings: &Settings, interrupt: Interrupt) -> yurt_vm::Result<()> {
    let executor = ProcessExecutor::new().with_interrupt(interrupt.clone());
    let vbox = VBoxManage::locate(executor.clone());

    let config = NegotiatorConfig {
        probe_existing: settings.reuse_forwards,
        ..Default::default()
    };
    let mut forwarding = PortForwarding::new(
        Negotiator::new(vbox)
            .with_config(config)
            .with_interrupt(interrupt),
        ConfigStore::open(settings.paths.config_file()),
    );

    let ssh = SshProbe::new(
        executor,
        settings.ssh_user.as_str(),
        &settings.ssh_key,
        settings.paths.known_hosts_file(),
    );
    let ssh_port = forwarding.expose(Service::Ssh, &ssh).await?;
    println!(
        "ssh: ssh -p {ssh_port} -i {} {}@localhost",
        settings.ssh_key.display(),
        settings.ssh_user
    );

    let lxd_port = forwarding.expose(Service::Lxd, &TcpProbe::new()).await?;
    println!("lxd: https://127.0.0.1:{lxd_port}");

    Ok(())
}

/// Exit status for errors that are not failures of their own.
fn interrupted_exit(err: &VmError) -> Option<u8> {
    err.is_interrupted().then_some(INTERRUPTED_EXIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yurt_core::CoreError;

    #[test]
    fn test_interrupt_exits_130() {
        let err = VmError::Interrupted { rule: "ssh".into() };
        assert_eq!(interrupted_exit(&err), Some(130));

        let err = VmError::from(CoreError::Interrupted {
            program: "VBoxManage".into(),
        });
        assert_eq!(interrupted_exit(&err), Some(130));
    }

    #[test]
    fn test_other_errors_propagate() {
        let err = VmError::NegotiationExhausted {
            rule: "ssh".into(),
            port: 4050,
            attempts: 5,
        };
        assert_eq!(interrupted_exit(&err), None);
    }
}
