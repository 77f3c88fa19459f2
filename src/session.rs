// src/session.rs
use std::sync::Arc;

use crate::config::Config;
use crate::control::{CleanupReport, NetworkControlPlane};
use crate::error::SetupError;
use crate::fingerprint::{self, FingerprintProfile, FingerprintProfileEngine, KernelSnapshot};
use crate::interface::{InterfaceManager, VirtualInterface};
use crate::routing::{RoutingPolicy, RoutingPolicyManager};
use crate::rules::{FirewallRule, RuleOrchestrator};

/// Per-run parameters shared by the setup stages. Owned by the main task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub interface: String,
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub connected: bool,
}

impl SessionState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interface: config.interface.clone(),
            local_port: config.local_port,
            target_host: config.target_host.clone(),
            target_port: config.target_port,
            connected: false,
        }
    }
}

/// Host network configuration held for the lifetime of a run.
///
/// `acquire` brings the stages up in order (interface, firewall rules,
/// routing policy, fingerprint) and unwinds the finished ones if a later
/// stage fails. `release` tears down routing, rules and the interface. The
/// fingerprint sysctls are left as they are.
pub struct SystemNetworkState {
    session: SessionState,
    interfaces: InterfaceManager,
    rules: RuleOrchestrator,
    routing: RoutingPolicyManager,
    interface: VirtualInterface,
    applied_rules: Vec<FirewallRule>,
    policy: RoutingPolicy,
    profile: FingerprintProfile,
    before: KernelSnapshot,
    after: KernelSnapshot,
    released: bool,
}

impl SystemNetworkState {
    pub fn acquire(control: Arc<dyn NetworkControlPlane>, config: &Config) -> Result<Self, SetupError> {
        let session = SessionState::from_config(config);
        let profile =
            fingerprint::resolve_profile(&config.fingerprint, config.window_size, config.ttl)?;

        let interfaces = InterfaceManager::new(control.clone());
        let rules = RuleOrchestrator::new(control.clone());
        let routing = RoutingPolicyManager::new(control.clone());
        let engine = FingerprintProfileEngine::new(control);

        let mut interface = interfaces.create(&session.interface, config.mtu)?;

        let applied_rules = match rules.apply_rules(&session) {
            Ok(applied) => applied,
            Err(partial) => {
                log::error!("Firewall setup failed, rolling back");
                rules.cleanup_applied(&partial.applied);
                close_interface(&interfaces, &mut interface);
                return Err(partial.error);
            }
        };
        log::info!("Firewall rules configured");

        let policy = match routing.setup(&session.interface, &session.target_host) {
            Ok(policy) => policy,
            Err(e) => {
                log::error!("Routing setup failed, rolling back");
                routing.cleanup(&session.interface, &session.target_host);
                rules.cleanup_applied(&applied_rules);
                close_interface(&interfaces, &mut interface);
                return Err(e);
            }
        };
        log::info!("Routing configured");

        let before = engine.current_snapshot();
        log::info!("TCP settings before: {}", before);

        let applied = engine.apply(&profile, &session.interface);
        if applied.written.contains(&"mtu") {
            interface.record_mtu(profile.mss);
        }

        let after = engine.current_snapshot();
        log::info!("TCP settings after: {}", after);
        let changed = before.differences(&after);
        if !changed.is_empty() {
            log::info!("Changed: {}", changed.join(", "));
        }

        Ok(Self {
            session,
            interfaces,
            rules,
            routing,
            interface,
            applied_rules,
            policy,
            profile,
            before,
            after,
            released: false,
        })
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn mark_connected(&mut self) {
        self.session.connected = true;
    }

    pub fn interface(&self) -> &VirtualInterface {
        &self.interface
    }

    pub fn applied_rules(&self) -> &[FirewallRule] {
        &self.applied_rules
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn profile(&self) -> &FingerprintProfile {
        &self.profile
    }

    pub fn snapshots(&self) -> (&KernelSnapshot, &KernelSnapshot) {
        (&self.before, &self.after)
    }

    /// Tears everything down, attempting every step regardless of earlier
    /// failures. Calling it again does nothing.
    pub fn release(&mut self) -> CleanupReport {
        if self.released {
            return CleanupReport::default();
        }
        self.released = true;

        let mut report = self
            .routing
            .cleanup(&self.session.interface, &self.session.target_host);
        report.merge(self.rules.cleanup_rules(&self.session));
        report.record(
            &format!("interface {}", self.session.interface),
            self.interfaces.close(&mut self.interface),
        );

        self.session.connected = false;
        report
    }
}

impl Drop for SystemNetworkState {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Network state dropped without release, cleaning up");
            self.release();
        }
    }
}

fn close_interface(interfaces: &InterfaceManager, interface: &mut VirtualInterface) {
    if let Err(e) = interfaces.close(interface) {
        log::warn!("Failed to remove interface {}: {}", interface.name(), e);
    }
}
