// src/config.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

use crate::fingerprint::{self, FingerprintProfile};

const MIN_MTU: u16 = 68;
// IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_NAME: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target_host: String,
    pub target_port: u16,
    pub interface: String,
    pub local_port: u16,
    pub capture_file: Option<PathBuf>,
    pub handshake_file: Option<PathBuf>,
    pub window_size: u16,
    pub ttl: u8,
    pub mtu: u16,
    pub fingerprint: String,
    pub settle_delay_ms: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Checks everything that can be checked without touching the host and
    /// resolves the fingerprint profile.
    pub fn validate(&self) -> Result<FingerprintProfile> {
        if self.target_host.trim().is_empty() {
            anyhow::bail!("target host must not be empty");
        }
        if self.target_port == 0 || self.local_port == 0 {
            anyhow::bail!("ports must be non-zero");
        }
        if self.interface.is_empty() || self.interface.len() > MAX_INTERFACE_NAME {
            anyhow::bail!(
                "interface name must be 1..={} bytes, got '{}'",
                MAX_INTERFACE_NAME,
                self.interface
            );
        }
        if self.mtu < MIN_MTU {
            anyhow::bail!("mtu {} is below the minimum of {}", self.mtu, MIN_MTU);
        }

        let profile = fingerprint::resolve_profile(&self.fingerprint, self.window_size, self.ttl)?;
        Ok(profile)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_host: "example.com".to_string(),
            target_port: 80,
            interface: "tun0".to_string(),
            local_port: 8080,
            capture_file: None,
            handshake_file: None,
            window_size: 8192,
            ttl: 64,
            mtu: 1500,
            fingerprint: "windows".to_string(),
            settle_delay_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SetupError;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let profile = Config::default().validate().unwrap();
        assert_eq!(profile.window_size, 8192);
        assert_eq!(profile.ttl, 64);
        assert!(!profile.timestamps);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"target_host": "10.1.2.3", "fingerprint": "macos", "capture_file": "/tmp/x.pcap"}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.target_host, "10.1.2.3");
        assert_eq!(config.fingerprint, "macos");
        assert_eq!(config.capture_file, Some(PathBuf::from("/tmp/x.pcap")));
        assert_eq!(config.local_port, 8080);
        assert_eq!(config.settle_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_errors() {
        assert!(Config::load(Path::new("/nonexistent/config.json")).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            Config { mtu: 40, ..Config::default() },
            Config { local_port: 0, ..Config::default() },
            Config { interface: "a-very-long-ifname".to_string(), ..Config::default() },
            Config { target_host: " ".to_string(), ..Config::default() },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_validate_unknown_profile() {
        let config = Config { fingerprint: "solaris".to_string(), ..Config::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::UnknownProfile(_))
        ));
    }
}
