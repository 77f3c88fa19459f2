// src/rules.rs
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::control::{CleanupReport, Invocation, NetworkControlPlane};
use crate::error::SetupError;
use crate::session::SessionState;

/// Firewall mark shared by the mangle rules and the routing policy.
pub const MARK_VALUE: &str = "0x1337";

const IP_FORWARD_KEY: &str = "net.ipv4.ip_forward";
const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

const REQUIRED_CHAINS: [(&str, &str); 7] = [
    ("filter", "INPUT"),
    ("filter", "OUTPUT"),
    ("filter", "FORWARD"),
    ("nat", "PREROUTING"),
    ("nat", "POSTROUTING"),
    ("mangle", "PREROUTING"),
    ("mangle", "OUTPUT"),
];

/// A single iptables rule. The same value produces both the `-A` command
/// that installs it and the `-D` command that removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl FirewallRule {
    fn new<I, S>(table: &'static str, chain: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            chain,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn append(&self) -> Invocation {
        self.invocation("-A")
    }

    pub fn delete(&self) -> Invocation {
        self.invocation("-D")
    }

    fn invocation(&self, op: &str) -> Invocation {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            op.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.args.iter().cloned());
        Invocation::new("iptables", args)
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.table, self.chain, self.args.join(" "))
    }
}

/// The fixed rule sequence for a session, in application order.
pub fn session_rules(session: &SessionState) -> Vec<FirewallRule> {
    let lport = session.local_port.to_string();
    let tun = session.interface.as_str();
    let host = session.target_host.as_str();

    vec![
        FirewallRule::new(
            "filter",
            "INPUT",
            ["-p", "tcp", "--dport", lport.as_str(), "-j", "ACCEPT"],
        ),
        FirewallRule::new(
            "mangle",
            "OUTPUT",
            ["-p", "tcp", "--sport", lport.as_str(), "-j", "MARK", "--set-mark", MARK_VALUE],
        ),
        FirewallRule::new(
            "mangle",
            "OUTPUT",
            ["-p", "tcp", "-d", host, "-j", "MARK", "--set-mark", MARK_VALUE],
        ),
        FirewallRule::new(
            "filter",
            "FORWARD",
            ["-i", "lo", "-o", tun, "-m", "mark", "--mark", MARK_VALUE, "-j", "ACCEPT"],
        ),
        FirewallRule::new(
            "filter",
            "FORWARD",
            ["-i", tun, "-o", "lo", "-m", "mark", "--mark", MARK_VALUE, "-j", "ACCEPT"],
        ),
        FirewallRule::new("nat", "POSTROUTING", ["-o", tun, "-j", "MASQUERADE"]),
    ]
}

/// `apply_rules` stopped early. `applied` holds the rules that did go in;
/// the caller owns removing them.
#[derive(Debug, thiserror::Error)]
#[error("{error} ({} rule(s) were applied before the failure)", .applied.len())]
pub struct PartialApply {
    pub applied: Vec<FirewallRule>,
    #[source]
    pub error: SetupError,
}

pub struct RuleOrchestrator {
    control: Arc<dyn NetworkControlPlane>,
}

impl RuleOrchestrator {
    pub fn new(control: Arc<dyn NetworkControlPlane>) -> Self {
        Self { control }
    }

    /// Creates `chain` in `table` unless it is already there.
    pub fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), SetupError> {
        let listed = self
            .control
            .run(&Invocation::new("iptables", ["-t", table, "-L", chain]));
        if listed.is_ok() {
            return Ok(());
        }

        match self
            .control
            .run(&Invocation::new("iptables", ["-t", table, "-N", chain]))
        {
            Ok(_) => {
                log::info!("Created chain {} in table {}", chain, table);
                Ok(())
            }
            Err(e) if e.reports_existing() => Ok(()),
            Err(e) => Err(SetupError::RuleApply(e)),
        }
    }

    pub fn apply_rules(&self, session: &SessionState) -> Result<Vec<FirewallRule>, PartialApply> {
        for (table, chain) in REQUIRED_CHAINS {
            self.ensure_chain(table, chain).map_err(|error| PartialApply {
                applied: Vec::new(),
                error,
            })?;
        }

        let mut applied = Vec::new();
        for rule in session_rules(session) {
            if let Err(e) = self.control.apply_firewall_rule(&rule) {
                log::error!("Failed to apply iptables rule: {}", rule);
                return Err(PartialApply {
                    applied,
                    error: SetupError::RuleApply(e),
                });
            }
            log::info!("Applied iptables rule: {}", rule);
            applied.push(rule);
        }

        if !self.enable_ip_forwarding() {
            log::warn!("Continuing without IP forwarding, some traffic may not be routed");
        }

        Ok(applied)
    }

    /// Removes every rule of the session in application order. Rules that
    /// were never applied show up as failures in the report.
    pub fn cleanup_rules(&self, session: &SessionState) -> CleanupReport {
        self.cleanup_applied(&session_rules(session))
    }

    pub fn cleanup_applied(&self, rules: &[FirewallRule]) -> CleanupReport {
        let mut report = CleanupReport::default();
        for rule in rules {
            report.record(
                &format!("iptables rule {}", rule),
                self.control.delete_firewall_rule(rule),
            );
        }
        report
    }

    /// Returns whether forwarding ended up enabled.
    pub fn enable_ip_forwarding(&self) -> bool {
        let current = self
            .control
            .run(&Invocation::new("cat", [IP_FORWARD_PATH]))
            .map(|out| out.trim().to_string());
        if matches!(current.as_deref(), Ok("1")) {
            log::info!("IP forwarding already enabled");
            return true;
        }

        if let Err(e) = self.control.set_kernel_parameter(IP_FORWARD_KEY, "1") {
            log::warn!("Failed to enable IP forwarding via sysctl: {}", e);

            if let Err(e) = self.control.write_file(Path::new(IP_FORWARD_PATH), "1\n") {
                log::warn!("Failed to enable IP forwarding via {}: {}", IP_FORWARD_PATH, e);
                return false;
            }
        }

        log::info!("IP forwarding enabled");
        true
    }
}
