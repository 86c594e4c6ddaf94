//! Negotiator behavior against a recording NAT table.
//!
//! All tests run on a paused tokio clock, so the settle and reselect waits
//! elapse instantly.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use yurt_core::{ConfigStore, CoreError, Interrupt, Key, RetryPolicy};
use yurt_vm::{
    ForwardRequest, NatControl, NatRule, Negotiator, NegotiatorConfig, Phase, PortForwarding,
    PortPicker, Probe, RandomPorts, Service, VmError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum NatEvent {
    Remove(String),
    Add(NatRule),
}

/// NAT table double recording every call in order.
#[derive(Default)]
struct RecordingNat {
    events: Mutex<Vec<NatEvent>>,
    failing_adds: AtomicU32,
    fail_removes: bool,
    interrupted_adds: bool,
}

impl RecordingNat {
    fn failing_adds(n: u32) -> Self {
        Self {
            failing_adds: AtomicU32::new(n),
            ..Default::default()
        }
    }

    fn events(&self) -> Vec<NatEvent> {
        self.events.lock().unwrap().clone()
    }

    fn added_ports(&self) -> Vec<u16> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                NatEvent::Add(rule) => Some(rule.host_port),
                NatEvent::Remove(_) => None,
            })
            .collect()
    }

    fn count(&self, adds: bool) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, NatEvent::Add(_)) == adds)
            .count()
    }
}

fn process_failure() -> CoreError {
    CoreError::ProcessFailed {
        program: "VBoxManage".into(),
        code: 1,
        stderr: "VBoxManage: error: The machine is not running".into(),
    }
}

#[async_trait]
impl NatControl for RecordingNat {
    async fn add_rule(&self, _vm: &str, rule: &NatRule) -> yurt_core::Result<()> {
        self.events.lock().unwrap().push(NatEvent::Add(rule.clone()));
        if self.interrupted_adds {
            return Err(CoreError::Interrupted {
                program: "VBoxManage".into(),
            });
        }
        let failing = self.failing_adds.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_adds.store(failing - 1, Ordering::SeqCst);
            return Err(process_failure());
        }
        Ok(())
    }

    async fn remove_rule(&self, _vm: &str, name: &str) -> yurt_core::Result<bool> {
        self.events
            .lock()
            .unwrap()
            .push(NatEvent::Remove(name.to_string()));
        if self.fail_removes {
            return Err(CoreError::ProcessTimedOut {
                program: "VBoxManage".into(),
                timeout: Duration::from_secs(60),
            });
        }
        Ok(true)
    }
}

/// Reachable only on one port.
struct OnlyPort {
    port: u16,
    probes: AtomicU32,
}

impl OnlyPort {
    fn new(port: u16) -> Self {
        Self {
            port,
            probes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Probe for OnlyPort {
    async fn probe(&self, port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        port == self.port
    }
}

/// Never reachable.
#[derive(Default)]
struct Unreachable {
    probes: AtomicU32,
}

#[async_trait]
impl Probe for Unreachable {
    async fn probe(&self, _port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        false
    }
}

/// Stands in for a login killed by Ctrl-C: sets the latch, reports failure.
struct InterruptedLogin(Interrupt);

#[async_trait]
impl Probe for InterruptedLogin {
    async fn probe(&self, _port: u16) -> bool {
        self.0.trigger();
        false
    }
}

/// Hands out a fixed sequence of ports and panics when drained.
struct ScriptedPorts(VecDeque<u16>);

impl ScriptedPorts {
    fn new(ports: &[u16]) -> Self {
        Self(ports.iter().copied().collect())
    }
}

impl PortPicker for ScriptedPorts {
    fn pick(&mut self, range: Range<u16>) -> u16 {
        let port = self.0.pop_front().expect("no scripted port left");
        assert!(range.contains(&port));
        port
    }
}

fn quiet_config() -> NegotiatorConfig {
    NegotiatorConfig {
        rule_retry: RetryPolicy::new(3, Duration::from_secs(3)).with_indicator(false),
        ..Default::default()
    }
}

fn scripted(nat: RecordingNat, ports: &[u16]) -> Negotiator<RecordingNat, ScriptedPorts> {
    Negotiator::new(nat)
        .with_config(quiet_config())
        .with_picker(ScriptedPorts::new(ports))
}

fn ssh_request(host_port: Option<u16>) -> ForwardRequest {
    ForwardRequest::new("yurt", "ssh", 22).with_host_port(host_port)
}

#[tokio::test(start_paused = true)]
async fn test_remembered_port_reachable_first_try() {
    let mut negotiator = scripted(RecordingNat::default(), &[]);
    let probe = OnlyPort::new(4050);

    let port = negotiator
        .negotiate(&ssh_request(Some(4050)), &probe)
        .await
        .unwrap();

    assert_eq!(port, 4050);
    assert_eq!(negotiator.phase(), Phase::Connected);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
    assert_eq!(
        negotiator.nat().events(),
        vec![
            NatEvent::Remove("ssh".into()),
            NatEvent::Add(NatRule::new("ssh", 4050, 22)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_default_start_port_is_pool_low() {
    let mut negotiator = scripted(RecordingNat::default(), &[]);
    let port = negotiator
        .negotiate(&ssh_request(None), &OnlyPort::new(4000))
        .await
        .unwrap();
    assert_eq!(port, 4000);
}

#[tokio::test(start_paused = true)]
async fn test_reselects_until_reachable() {
    let mut negotiator = scripted(RecordingNat::default(), &[4010, 4020]);
    let port = negotiator
        .negotiate(&ssh_request(None), &OnlyPort::new(4020))
        .await
        .unwrap();

    assert_eq!(port, 4020);
    assert_eq!(negotiator.nat().added_ports(), vec![4000, 4010, 4020]);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_after_configured_attempts() {
    let mut negotiator = scripted(RecordingNat::default(), &[4011, 4022, 4033, 4044]);
    let probe = Unreachable::default();
    let started = Instant::now();

    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &probe)
        .await
        .unwrap_err();

    match err {
        VmError::NegotiationExhausted {
            rule,
            port,
            attempts,
        } => {
            assert_eq!(rule, "ssh");
            assert_eq!(port, 4044);
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected error: {other}"),
    }

    let nat = negotiator.nat();
    assert_eq!(nat.count(true), 5);
    assert_eq!(nat.count(false), 5);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 5);
    assert_eq!(negotiator.phase(), Phase::Unreachable);

    // 5 settle waits of 2s and 4 reselect waits of 7s.
    assert!(started.elapsed() >= Duration::from_secs(38));
    assert!(started.elapsed() < Duration::from_secs(39));
}

#[tokio::test(start_paused = true)]
async fn test_remove_always_precedes_add() {
    let mut negotiator = scripted(RecordingNat::default(), &[4001, 4002]);
    let config = NegotiatorConfig {
        attempts: 3,
        ..quiet_config()
    };
    negotiator = negotiator.with_config(config);

    let _ = negotiator
        .negotiate(&ssh_request(None), &Unreachable::default())
        .await;

    let events = negotiator.nat().events();
    assert_eq!(events.len(), 6);
    for pair in events.chunks(2) {
        assert_eq!(pair[0], NatEvent::Remove("ssh".into()));
        assert!(matches!(&pair[1], NatEvent::Add(rule) if rule.name == "ssh" && rule.guest_port == 22));
    }
}

#[tokio::test(start_paused = true)]
async fn test_converges_on_single_reachable_port() {
    let config = NegotiatorConfig {
        attempts: 99 * 20,
        ..quiet_config()
    };
    let mut negotiator = Negotiator::new(RecordingNat::default())
        .with_config(config)
        .with_picker(RandomPorts::seeded(2024));

    let port = negotiator
        .negotiate(&ssh_request(None), &OnlyPort::new(4077))
        .await
        .unwrap();
    assert_eq!(port, 4077);
}

#[tokio::test(start_paused = true)]
async fn test_add_rule_failure_is_fatal() {
    let mut negotiator = scripted(RecordingNat::failing_adds(u32::MAX), &[]);
    let probe = Unreachable::default();

    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &probe)
        .await
        .unwrap_err();

    assert!(matches!(err, VmError::Negotiation { ref rule, .. } if rule == "ssh"));
    // first try plus 3 retries, no reselection and no probing
    assert_eq!(negotiator.nat().count(true), 4);
    assert_eq!(negotiator.nat().count(false), 1);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_add_failure_retried() {
    let mut negotiator = scripted(RecordingNat::failing_adds(2), &[]);
    let port = negotiator
        .negotiate(&ssh_request(Some(4050)), &OnlyPort::new(4050))
        .await
        .unwrap();

    assert_eq!(port, 4050);
    assert_eq!(negotiator.nat().added_ports(), vec![4050, 4050, 4050]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_failure_ignored() {
    let nat = RecordingNat {
        fail_removes: true,
        ..Default::default()
    };
    let mut negotiator = scripted(nat, &[]);
    let port = negotiator
        .negotiate(&ssh_request(Some(4050)), &OnlyPort::new(4050))
        .await
        .unwrap();
    assert_eq!(port, 4050);
}

#[tokio::test(start_paused = true)]
async fn test_probe_existing_skips_nat_table() {
    let config = NegotiatorConfig {
        probe_existing: true,
        ..quiet_config()
    };
    let mut negotiator = scripted(RecordingNat::default(), &[]).with_config(config);

    let port = negotiator
        .negotiate(&ssh_request(Some(4050)), &OnlyPort::new(4050))
        .await
        .unwrap();
    assert_eq!(port, 4050);
    assert!(negotiator.nat().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected() {
    let config = NegotiatorConfig {
        port_range: 5000..5000,
        ..quiet_config()
    };
    let mut negotiator = scripted(RecordingNat::default(), &[]).with_config(config);
    let err = negotiator
        .negotiate(&ssh_request(None), &OnlyPort::new(5000))
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::Config(_)));
    assert!(negotiator.nat().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expose_persists_negotiated_port() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json"));
    store.set(Key::VmName, "yurt").unwrap();
    store.set(Key::SshPort, "4050").unwrap();

    let mut forwarding = PortForwarding::new(scripted(RecordingNat::default(), &[4060]), store);
    let port = forwarding
        .expose(Service::Ssh, &OnlyPort::new(4060))
        .await
        .unwrap();

    assert_eq!(port, 4060);
    assert_eq!(
        forwarding.store().get(Key::SshPort).unwrap().as_deref(),
        Some("4060")
    );
    assert_eq!(forwarding.negotiator().nat().added_ports(), vec![4050, 4060]);
}

#[tokio::test(start_paused = true)]
async fn test_expose_lxd_uses_its_own_rule() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json"));
    store.set(Key::VmName, "yurt").unwrap();

    let mut forwarding = PortForwarding::new(scripted(RecordingNat::default(), &[]), store);
    let port = forwarding
        .expose(Service::Lxd, &OnlyPort::new(4000))
        .await
        .unwrap();

    assert_eq!(port, 4000);
    assert_eq!(
        forwarding.negotiator().nat().events()[1],
        NatEvent::Add(NatRule::new("lxd", 4000, 8443))
    );
    assert_eq!(
        forwarding.store().get(Key::LxdPort).unwrap().as_deref(),
        Some("4000")
    );
}

#[tokio::test(start_paused = true)]
async fn test_expose_requires_vm_name() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json"));

    let mut forwarding = PortForwarding::new(scripted(RecordingNat::default(), &[]), store);
    let err = forwarding
        .expose(Service::Ssh, &OnlyPort::new(4000))
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::MissingConfig(Key::VmName)));
}

#[tokio::test(start_paused = true)]
async fn test_unparsable_stored_port_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json"));
    store.set(Key::VmName, "yurt").unwrap();
    store.set(Key::SshPort, "not-a-port").unwrap();

    let mut forwarding = PortForwarding::new(scripted(RecordingNat::default(), &[]), store);
    assert_eq!(forwarding.remembered_port(Service::Ssh).unwrap(), None);

    let port = forwarding
        .expose(Service::Ssh, &OnlyPort::new(4000))
        .await
        .unwrap();
    assert_eq!(port, 4000);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_leaves_stored_port_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json"));
    store.set(Key::VmName, "yurt").unwrap();
    store.set(Key::SshPort, "4050").unwrap();

    let config = NegotiatorConfig {
        attempts: 2,
        ..quiet_config()
    };
    let negotiator = scripted(RecordingNat::default(), &[4051]).with_config(config);
    let mut forwarding = PortForwarding::new(negotiator, store);

    let err = forwarding
        .expose(Service::Ssh, &Unreachable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::NegotiationExhausted { port: 4051, .. }));
    assert_eq!(
        forwarding.store().get(Key::SshPort).unwrap().as_deref(),
        Some("4050")
    );
}

fn trigger_after(interrupt: &Interrupt, delay: Duration) {
    let interrupt = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        interrupt.trigger();
    });
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_settle_aborts() {
    let interrupt = Interrupt::new();
    let mut negotiator = 
        scripted(RecordingNat::default(), &[4011]).with_interrupt(interrupt.clone());
    let probe = Unreachable::default();
    let started = Instant::now();

    trigger_after(&interrupt, Duration::from_secs(1));
    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &probe)
        .await
        .unwrap_err();

    assert!(matches!(err, VmError::Interrupted { ref rule } if rule == "ssh"));
    assert_eq!(negotiator.nat().count(true), 1);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 0);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_reselect_wait_aborts() {
    let interrupt = Interrupt::new();
    let mut negotiator = 
        scripted(RecordingNat::default(), &[4011]).with_interrupt(interrupt.clone());
    let probe = Unreachable::default();

    // first probe at 2s, reselect wait until 9s
    trigger_after(&interrupt, Duration::from_secs(5));
    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &probe)
        .await
        .unwrap_err();

    assert!(err.is_interrupted());
    assert_eq!(negotiator.nat().added_ports(), vec![4050]);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_login_does_not_reselect() {
    let interrupt = Interrupt::new();
    let mut negotiator = 
        scripted(RecordingNat::default(), &[]).with_interrupt(interrupt.clone());

    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &InterruptedLogin(interrupt))
        .await
        .unwrap_err();

    assert!(err.is_interrupted());
    assert_eq!(negotiator.nat().added_ports(), vec![4050]);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_add_rule_not_retried() {
    let nat = RecordingNat {
        interrupted_adds: true,
        ..Default::default()
    };
    let mut negotiator = scripted(nat, &[]);
    let started = Instant::now();

    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &Unreachable::default())
        .await
        .unwrap_err();

    assert!(matches!(err, VmError::Interrupted { .. }));
    assert_eq!(negotiator.nat().count(true), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_before_start_leaves_nat_untouched() {
    let interrupt = Interrupt::new();
    interrupt.trigger();
    let mut negotiator = scripted(RecordingNat::default(), &[]).with_interrupt(interrupt);

    let err = negotiator
        .negotiate(&ssh_request(Some(4050)), &OnlyPort::new(4050))
        .await
        .unwrap_err();

    assert!(err.is_interrupted());
    assert!(negotiator.nat().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_expose_keeps_stored_port() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json"));
    store.set(Key::VmName, "yurt").unwrap();
    store.set(Key::SshPort, "4050").unwrap();

    let interrupt = Interrupt::new();
    let negotiator = 
        scripted(RecordingNat::default(), &[4060]).with_interrupt(interrupt.clone());
    let mut forwarding = PortForwarding::new(negotiator, store);

    trigger_after(&interrupt, Duration::from_secs(1));
    let err = forwarding
        .expose(Service::Ssh, &OnlyPort::new(4060))
        .await
        .unwrap_err();

    assert!(err.is_interrupted());
    assert_eq!(
        forwarding.store().get(Key::SshPort).unwrap().as_deref(),
        Some("4050")
    );
}
