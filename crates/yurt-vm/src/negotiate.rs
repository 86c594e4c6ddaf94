//! Host port negotiation for NAT-forwarded guest services.
//!
//! A forwarding rule only counts once the service behind it answers a
//! probe. The negotiator installs a rule, waits for the hypervisor to apply
//! it, probes, and on failure moves the rule to a different host port.
//!
//! ```text
//!   Idle ──▶ RuleRemoved ──▶ RuleAdded ──▶ Verifying ──▶ Connected
//!                ▲                              │
//!                │      new random host port    ▼
//!                └─────────────────────── Unreachable
//! ```
//!
//! Every attempt removes the previous rule before adding the new one, so the
//! NAT table never holds two rules with the same name. The negotiator does
//! not persist anything; callers store the returned port.
//!
//! Each step races the negotiator's [`Interrupt`]. Once it is triggered the
//! negotiation stops with [`VmError::Interrupted`], whether a command, a wait
//! or a probe was in flight.

use crate::error::{Result, VmError};
use crate::nat::{NatControl, NatRule};
use crate::probe::Probe;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::time::Duration;
use yurt_core::{retry_if, CoreError, Interrupt, RetryPolicy};

/// Host ports handed out by default. Upper bound exclusive.
pub const DEFAULT_PORT_RANGE: Range<u16> = 4000..4099;

/// Chooses the next host port to try.
pub trait PortPicker: Send {
    /// A port within `range`.
    fn pick(&mut self, range: Range<u16>) -> u16;
}

/// Uniformly random ports.
#[derive(Debug, Clone)]
pub struct RandomPorts {
    rng: StdRng,
}

impl RandomPorts {
    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomPorts {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl PortPicker for RandomPorts {
    fn pick(&mut self, range: Range<u16>) -> u16 {
        self.rng.gen_range(range)
    }
}

/// Tunables for [`Negotiator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// Rules installed and probed before giving up (default: 5).
    pub attempts: u32,
    /// Pool new host ports are drawn from (default: 4000..4099).
    pub port_range: Range<u16>,
    /// Wait after adding a rule before probing (default: 2s).
    pub settle_time: Duration,
    /// Wait after a failed probe before the next attempt (default: 7s).
    pub reselect_wait: Duration,
    /// Retry policy for the add-rule command itself.
    pub rule_retry: RetryPolicy,
    /// Probe the initial port before touching the NAT table (default: false).
    pub probe_existing: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            port_range: DEFAULT_PORT_RANGE,
            settle_time: Duration::from_secs(2),
            reselect_wait: Duration::from_secs(7),
            rule_retry: RetryPolicy::default(),
            probe_existing: false,
        }
    }
}

impl NegotiatorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(VmError::Config("attempts must be > 0".into()));
        }
        if self.port_range.is_empty() {
            return Err(VmError::Config(format!(
                "port range {}..{} is empty",
                self.port_range.start, self.port_range.end
            )));
        }
        Ok(())
    }
}

/// What to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    /// VM whose NAT table is changed.
    pub vm: String,
    /// Rule name, one rule per name and VM.
    pub rule: String,
    /// Port the service listens on inside the guest.
    pub guest_port: u16,
    /// Host port from a previous session, tried first.
    pub host_port: Option<u16>,
}

impl ForwardRequest {
    /// Forward `guest_port` under `rule` on `vm`, starting from the default pool.
    pub fn new(vm: impl Into<String>, rule: impl Into<String>, guest_port: u16) -> Self {
        Self {
            vm: vm.into(),
            rule: rule.into(),
            guest_port,
            host_port: None,
        }
    }

    /// Start from a remembered host port.
    pub fn with_host_port(mut self, port: Option<u16>) -> Self {
        self.host_port = port;
        self
    }
}

/// Where a negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RuleRemoved,
    RuleAdded,
    Verifying,
    Connected,
    Unreachable,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::RuleRemoved => write!(f, "rule-removed"),
            Phase::RuleAdded => write!(f, "rule-added"),
            Phase::Verifying => write!(f, "verifying"),
            Phase::Connected => write!(f, "connected"),
            Phase::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Finds a host port whose forwarding rule leads to a live service.
pub struct Negotiator<N: NatControl, R: PortPicker = RandomPorts> {
    nat: N,
    picker: R,
    config: NegotiatorConfig,
    interrupt: Interrupt,
    phase: Phase,
}

impl<N: NatControl> Negotiator<N, RandomPorts> {
    /// Negotiator with default settings and entropy-seeded port selection.
    pub fn new(nat: N) -> Self {
        Self {
            nat,
            picker: RandomPorts::from_entropy(),
            config: NegotiatorConfig::default(),
            interrupt: Interrupt::new(),
            phase: Phase::Idle,
        }
    }
}

impl<N: NatControl, R: PortPicker> Negotiator<N, R> {
    /// Replace the settings.
    pub fn with_config(mut self, config: NegotiatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop negotiating once `interrupt` is triggered.
    ///
    /// Pass the same latch the NAT control and probes execute with.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Replace the port source.
    pub fn with_picker<R2: PortPicker>(self, picker: R2) -> Negotiator<N, R2> {
        Negotiator {
            nat: self.nat,
            picker,
            config: self.config,
            interrupt: self.interrupt,
            phase: self.phase,
        }
    }

    /// NAT handle in use.
    pub fn nat(&self) -> &N {
        &self.nat
    }

    /// Phase reached by the last negotiation.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Forward `request.guest_port` and return the verified host port.
    ///
    /// # Errors
    ///
    /// [`VmError::Negotiation`] if adding a rule fails even after retries,
    /// [`VmError::NegotiationExhausted`] if no attempt produced a reachable
    /// service, [`VmError::Interrupted`] on a manual interrupt.
    pub async fn negotiate<P: Probe + ?Sized>(
        &mut self,
        request: &ForwardRequest,
        probe: &P,
    ) -> Result<u16> {
        self.config.validate()?;
        self.enter(Phase::Idle, request);

        let mut host_port = request.host_port.unwrap_or(self.config.port_range.start);

        if self.config.probe_existing && request.host_port.is_some() {
            self.enter(Phase::Verifying, request);
            if self.interruptible(request, probe.probe(host_port)).await? {
                self.enter(Phase::Connected, request);
                tracing::info!(rule = %request.rule, host_port, "Existing forwarding still reachable");
                return Ok(host_port);
            }
        }

        let mut remaining = self.config.attempts;
        loop {
            tracing::debug!(
                rule = %request.rule,
                host_port,
                guest_port = request.guest_port,
                remaining,
                "Setting up forwarding"
            );

            let removed = self
                .interruptible(request, self.nat.remove_rule(&request.vm, &request.rule))
                .await?;
            match removed {
                Ok(existed) => tracing::trace!(rule = %request.rule, existed, "Previous rule cleared"),
                Err(e) if e.is_interrupted() => return Err(self.interrupted(request)),
                Err(e) => tracing::debug!(rule = %request.rule, error = %e, "Ignoring failure removing rule"),
            }
            self.enter(Phase::RuleRemoved, request);

            let rule = NatRule::new(request.rule.as_str(), host_port, request.guest_port);
            let nat = &self.nat;
            let vm = request.vm.as_str();
            let rule_ref = &rule;
            let added = retry_if(
                self.config.rule_retry,
                move || nat.add_rule(vm, rule_ref),
                |e: &CoreError| !e.is_interrupted(),
            );
            self.interruptible(request, added).await?.map_err(|e| {
                if e.is_interrupted() {
                    return self.interrupted(request);
                }
                tracing::error!(rule = %request.rule, host_port, error = %e, "Failed to add NAT rule");
                VmError::Negotiation {
                    rule: request.rule.clone(),
                    message: e.to_string(),
                }
            })?;
            self.enter(Phase::RuleAdded, request);

            self.interruptible(request, tokio::time::sleep(self.config.settle_time))
                .await?;

            self.enter(Phase::Verifying, request);
            if self.interruptible(request, probe.probe(host_port)).await? {
                self.enter(Phase::Connected, request);
                tracing::info!(
                    rule = %request.rule,
                    host_port,
                    guest_port = request.guest_port,
                    attempts = self.config.attempts - remaining + 1,
                    "Forwarding established"
                );
                return Ok(host_port);
            }
            self.enter(Phase::Unreachable, request);

            remaining -= 1;
            if remaining == 0 {
                tracing::warn!(rule = %request.rule, host_port, "Service unreachable, giving up");
                return Err(VmError::NegotiationExhausted {
                    rule: request.rule.clone(),
                    port: host_port,
                    attempts: self.config.attempts,
                });
            }

            let next = self.picker.pick(self.config.port_range.clone());
            tracing::debug!(
                rule = %request.rule,
                previous = host_port,
                next,
                remaining,
                "Service unreachable, trying another port"
            );
            host_port = next;

            self.interruptible(request, tokio::time::sleep(self.config.reselect_wait))
                .await?;
        }
    }

    /// Await `step` unless the interrupt fires first.
    async fn interruptible<F: Future>(
        &self,
        request: &ForwardRequest,
        step: F,
    ) -> Result<F::Output> {
        tokio::select! {
            biased;

            _ = self.interrupt.triggered() => Err(self.interrupted(request)),
            output = step => Ok(output),
        }
    }

    fn interrupted(&self, request: &ForwardRequest) -> VmError {
        tracing::warn!(rule = %request.rule, phase = %self.phase, "Negotiation interrupted");
        VmError::Interrupted {
            rule: request.rule.clone(),
        }
    }

    fn enter(&mut self, phase: Phase, request: &ForwardRequest) {
        tracing::trace!(rule = %request.rule, from = %self.phase, to = %phase, "Negotiation phase");
        self.phase = phase;
    }
}
