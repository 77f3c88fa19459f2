// src/fingerprint.rs
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::control::NetworkControlPlane;
use crate::error::{CommandError, SetupError};

pub const PROFILE_MSS: u16 = 1460;

const KEY_TTL: &str = "net.ipv4.ip_default_ttl";
const KEY_RMEM: &str = "net.ipv4.tcp_rmem";
const KEY_WMEM: &str = "net.ipv4.tcp_wmem";
const KEY_TIMESTAMPS: &str = "net.ipv4.tcp_timestamps";
const KEY_WINDOW_SCALING: &str = "net.ipv4.tcp_window_scaling";
const KEY_SACK: &str = "net.ipv4.tcp_sack";

const RMEM_MIN: u32 = 4096;
const RMEM_MAX: u32 = 6291456;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsProfile {
    Windows,
    Macos,
    Linux,
}

impl OsProfile {
    pub const ALL: [OsProfile; 3] = [OsProfile::Windows, OsProfile::Macos, OsProfile::Linux];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsProfile::Windows => "windows",
            OsProfile::Macos => "macos",
            OsProfile::Linux => "linux",
        }
    }

    fn timestamps(&self) -> bool {
        !matches!(self, OsProfile::Windows)
    }

    fn window_scale(&self) -> u8 {
        match self {
            OsProfile::Windows => 8,
            OsProfile::Macos => 6,
            OsProfile::Linux => 7,
        }
    }
}

impl FromStr for OsProfile {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OsProfile::ALL
            .into_iter()
            .find(|os| os.as_str() == s)
            .ok_or_else(|| SetupError::UnknownProfile(s.to_string()))
    }
}

impl fmt::Display for OsProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP stack parameters that make the host look like `os`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintProfile {
    pub os: OsProfile,
    pub window_size: u16,
    pub mss: u16,
    pub ttl: u8,
    pub timestamps: bool,
    pub window_scaling: bool,
    pub window_scale: u8,
    pub sack: bool,
}

impl FingerprintProfile {
    fn rmem(&self) -> String {
        format!("{} {} {}", RMEM_MIN, self.window_size, RMEM_MAX)
    }

    fn wmem(&self) -> String {
        let window = u32::from(self.window_size);
        format!("{} {} {}", RMEM_MIN, window, window * 2)
    }
}

/// Window size and TTL come from the caller; everything else is fixed per OS.
pub fn resolve_profile(os: &str, window_size: u16, ttl: u8) -> Result<FingerprintProfile, SetupError> {
    let os: OsProfile = os.parse()?;

    Ok(FingerprintProfile {
        os,
        window_size,
        mss: PROFILE_MSS,
        ttl,
        timestamps: os.timestamps(),
        window_scaling: true,
        window_scale: os.window_scale(),
        sack: true,
    })
}

/// `min default max` as printed by `sysctl -n net.ipv4.tcp_rmem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferTriple {
    pub min: u32,
    pub default: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferTripleError {
    #[error("expected 3 values, got {0}")]
    WrongCount(usize),
    #[error("invalid buffer size '{0}'")]
    Invalid(String),
}

impl FromStr for BufferTriple {
    type Err = BufferTripleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let &[min, default, max] = parts.as_slice() else {
            return Err(BufferTripleError::WrongCount(parts.len()));
        };
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| BufferTripleError::Invalid(v.to_string()))
        };
        Ok(Self {
            min: parse(min)?,
            default: parse(default)?,
            max: parse(max)?,
        })
    }
}

/// Current values of the parameters the engine can change. A `None` field
/// could not be read or parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelSnapshot {
    pub ttl: Option<u8>,
    pub tcp_rmem: Option<BufferTriple>,
    pub tcp_wmem: Option<BufferTriple>,
    pub timestamps: Option<bool>,
    pub window_scaling: Option<bool>,
    pub sack: Option<bool>,
    pub advmss: Option<u16>,
}

impl KernelSnapshot {
    /// Names of the fields whose value differs between two snapshots.
    pub fn differences(&self, other: &KernelSnapshot) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.ttl != other.ttl {
            changed.push("ttl");
        }
        if self.tcp_rmem != other.tcp_rmem {
            changed.push("tcp_rmem");
        }
        if self.tcp_wmem != other.tcp_wmem {
            changed.push("tcp_wmem");
        }
        if self.timestamps != other.timestamps {
            changed.push("timestamps");
        }
        if self.window_scaling != other.window_scaling {
            changed.push("window_scaling");
        }
        if self.sack != other.sack {
            changed.push("sack");
        }
        if self.advmss != other.advmss {
            changed.push("advmss");
        }
        changed
    }
}

impl fmt::Display for KernelSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl ApplyReport {
    fn record(&mut self, name: &'static str, result: Result<(), CommandError>) {
        match result {
            Ok(()) => self.written.push(name),
            Err(e) => {
                log::warn!("Failed to set {}: {}", name, e);
                self.failed.push(name);
            }
        }
    }
}

fn flag(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

fn parse_advmss(routes: &str) -> Option<u16> {
    let mut tokens = routes.split_whitespace();
    tokens.find(|t| *t == "advmss")?;
    tokens.next()?.parse().ok()
}

pub struct FingerprintProfileEngine {
    control: Arc<dyn NetworkControlPlane>,
}

impl FingerprintProfileEngine {
    pub fn new(control: Arc<dyn NetworkControlPlane>) -> Self {
        Self { control }
    }

    /// Writes the profile as host-wide kernel settings. Each write stands on
    /// its own; nothing is rolled back and the values outlive the process.
    pub fn apply(&self, profile: &FingerprintProfile, interface: &str) -> ApplyReport {
        log::info!(
            "Applying {} fingerprint (window {}, ttl {})",
            profile.os,
            profile.window_size,
            profile.ttl
        );

        let cp = &self.control;
        let mut report = ApplyReport::default();

        report.record("ttl", cp.set_kernel_parameter(KEY_TTL, &profile.ttl.to_string()));
        report.record("tcp_rmem", cp.set_kernel_parameter(KEY_RMEM, &profile.rmem()));
        report.record("tcp_wmem", cp.set_kernel_parameter(KEY_WMEM, &profile.wmem()));
        report.record(
            "timestamps",
            cp.set_kernel_parameter(KEY_TIMESTAMPS, flag(profile.timestamps)),
        );
        if profile.window_scaling {
            report.record(
                "window_scaling",
                cp.set_kernel_parameter(KEY_WINDOW_SCALING, "1"),
            );
        }
        report.record("sack", cp.set_kernel_parameter(KEY_SACK, flag(profile.sack)));
        report.record("mtu", cp.set_link_mtu(interface, profile.mss));

        if report.failed.is_empty() {
            log::info!("Fingerprint applied");
        } else {
            log::warn!(
                "Fingerprint partially applied, failed: {}",
                report.failed.join(", ")
            );
        }
        report
    }

    pub fn current_snapshot(&self) -> KernelSnapshot {
        let cp = &self.control;
        let read = |key: &str| cp.kernel_parameter(key);

        KernelSnapshot {
            ttl: read(KEY_TTL).and_then(|v| v.parse().ok()),
            tcp_rmem: read(KEY_RMEM).and_then(|v| v.parse().ok()),
            tcp_wmem: read(KEY_WMEM).and_then(|v| v.parse().ok()),
            timestamps: read(KEY_TIMESTAMPS).as_deref().and_then(parse_flag),
            window_scaling: read(KEY_WINDOW_SCALING).as_deref().and_then(parse_flag),
            sack: read(KEY_SACK).as_deref().and_then(parse_flag),
            advmss: cp
                .ip(&["route", "show"])
                .ok()
                .as_deref()
                .and_then(parse_advmss),
        }
    }
}
