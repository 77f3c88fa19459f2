// src/routing.rs
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::control::{CleanupReport, Invocation, NetworkControlPlane};
use crate::error::SetupError;
use crate::rules::MARK_VALUE;

pub const ROUTING_TABLE: &str = "100";
pub const INTERFACE_ADDRESS: &str = "10.0.0.1/24";
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// A route inside the policy table, always through the TUN interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEntry {
    Host { target: Ipv4Addr, interface: String },
    Default { gateway: Ipv4Addr, interface: String },
}

impl RouteEntry {
    pub fn add(&self) -> Invocation {
        self.invocation("add")
    }

    pub fn delete(&self) -> Invocation {
        self.invocation("del")
    }

    fn invocation(&self, op: &str) -> Invocation {
        let mut args = vec!["route".to_string(), op.to_string()];
        match self {
            RouteEntry::Host { target, interface } => {
                args.extend([target.to_string(), "dev".to_string(), interface.clone()]);
            }
            RouteEntry::Default { gateway, interface } => {
                args.extend([
                    "default".to_string(),
                    "via".to_string(),
                    gateway.to_string(),
                    "dev".to_string(),
                    interface.clone(),
                ]);
            }
        }
        args.extend(["table".to_string(), ROUTING_TABLE.to_string()]);
        Invocation::new("ip", args)
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteEntry::Host { target, interface } => {
                write!(f, "{} dev {} table {}", target, interface, ROUTING_TABLE)
            }
            RouteEntry::Default { gateway, interface } => write!(
                f,
                "default via {} dev {} table {}",
                gateway, interface, ROUTING_TABLE
            ),
        }
    }
}

/// What `setup` installed: the fwmark rule and the routes of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub mark: &'static str,
    pub table: &'static str,
    pub target: Ipv4Addr,
    pub routes: Vec<RouteEntry>,
}

fn policy_routes(interface: &str, target: Ipv4Addr) -> Vec<RouteEntry> {
    vec![
        RouteEntry::Host {
            target,
            interface: interface.to_string(),
        },
        RouteEntry::Default {
            gateway: GATEWAY,
            interface: interface.to_string(),
        },
    ]
}

pub struct RoutingPolicyManager {
    control: Arc<dyn NetworkControlPlane>,
}

impl RoutingPolicyManager {
    pub fn new(control: Arc<dyn NetworkControlPlane>) -> Self {
        Self { control }
    }

    pub fn setup(&self, interface: &str, target_host: &str) -> Result<RoutingPolicy, SetupError> {
        let target = self.control.resolve_ipv4(target_host)?;
        log::info!("Target {} resolves to {}", target_host, target);

        self.control
            .ip(&["addr", "add", INTERFACE_ADDRESS, "dev", interface])
            .map_err(SetupError::Routing)?;

        self.control
            .ip(&["rule", "add", "fwmark", MARK_VALUE, "table", ROUTING_TABLE])
            .map_err(SetupError::Routing)?;
        log::info!("Added policy rule fwmark {} table {}", MARK_VALUE, ROUTING_TABLE);

        let routes = policy_routes(interface, target);
        for route in &routes {
            self.control.add_route(route).map_err(SetupError::Routing)?;
            log::info!("Added route {}", route);
        }

        Ok(RoutingPolicy {
            mark: MARK_VALUE,
            table: ROUTING_TABLE,
            target,
            routes,
        })
    }

    /// Best-effort removal of everything `setup` installs. An unresolvable
    /// host means there is nothing to clean.
    pub fn cleanup(&self, interface: &str, target_host: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        let target = match self.control.resolve_ipv4(target_host) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("Skipping routing cleanup: {}", e);
                return report;
            }
        };

        for route in policy_routes(interface, target).iter().rev() {
            report.record(&format!("route {}", route), self.control.delete_route(route));
        }

        report.record(
            &format!("rule fwmark {} table {}", MARK_VALUE, ROUTING_TABLE),
            self.control
                .ip(&["rule", "del", "fwmark", MARK_VALUE, "table", ROUTING_TABLE])
                .map(drop),
        );

        report.record(
            &format!("address {} on {}", INTERFACE_ADDRESS, interface),
            self.control
                .ip(&["addr", "del", INTERFACE_ADDRESS, "dev", interface])
                .map(drop),
        );

        report
    }
}
