// src/interface.rs
use std::fs::File;
use std::sync::Arc;

use crate::control::NetworkControlPlane;
use crate::error::{CommandError, SetupError};

/// The TUN device created for one run. Only `InterfaceManager` creates or
/// destroys it.
#[derive(Debug)]
pub struct VirtualInterface {
    name: String,
    mtu: u16,
    handle: Option<File>,
    active: bool,
}

impl VirtualInterface {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The MTU last set on the link.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Records an MTU change made on the link outside `InterfaceManager`.
    pub fn record_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// Raw packet access to the device, when one could be opened.
    pub fn data_path(&self) -> Option<&File> {
        self.handle.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub struct InterfaceManager {
    control: Arc<dyn NetworkControlPlane>,
}

impl InterfaceManager {
    pub fn new(control: Arc<dyn NetworkControlPlane>) -> Self {
        Self { control }
    }

    pub fn create(&self, name: &str, mtu: u16) -> Result<VirtualInterface, SetupError> {
        self.preempt_stale(name)?;

        if let Err(e) = self.control.ip(&["tuntap", "add", "dev", name, "mode", "tun"]) {
            return Err(if e.reports_existing() {
                SetupError::AlreadyExists(name.to_string())
            } else {
                SetupError::Configuration(format!("failed to create {}: {}", name, e))
            });
        }

        if let Err(e) = self.control.set_link_mtu(name, mtu) {
            self.rollback(name);
            return Err(SetupError::Configuration(format!(
                "failed to set mtu {} on {}: {}",
                mtu, name, e
            )));
        }

        if let Err(e) = self.control.ip(&["link", "set", "dev", name, "up"]) {
            self.rollback(name);
            return Err(SetupError::Configuration(format!(
                "failed to bring up {}: {}",
                name, e
            )));
        }

        let handle = match self.control.open_data_path(name) {
            Ok(handle) => handle,
            Err(e) => {
                self.rollback(name);
                return Err(SetupError::Configuration(format!(
                    "failed to open data path for {}: {}",
                    name, e
                )));
            }
        };

        log::info!("Created TUN interface {} (mtu {})", name, mtu);

        Ok(VirtualInterface {
            name: name.to_string(),
            mtu,
            handle,
            active: true,
        })
    }

    /// Closes the data path and deletes the interface. A second call on the
    /// same instance does nothing.
    pub fn close(&self, iface: &mut VirtualInterface) -> Result<(), CommandError> {
        if !iface.active {
            return Ok(());
        }

        drop(iface.handle.take());
        self.delete(&iface.name)?;
        iface.active = false;

        log::info!("Removed TUN interface {}", iface.name);
        Ok(())
    }

    fn preempt_stale(&self, name: &str) -> Result<(), SetupError> {
        if self.control.ip(&["link", "show", name]).is_err() {
            return Ok(());
        }

        log::warn!("Interface {} already exists, removing it", name);
        self.delete(name).map_err(|e| {
            log::error!("Could not remove stale interface {}: {}", name, e);
            SetupError::AlreadyExists(name.to_string())
        })
    }

    fn delete(&self, name: &str) -> Result<(), CommandError> {
        self.control
            .ip(&["tuntap", "del", "dev", name, "mode", "tun"])
            .map(drop)
    }

    fn rollback(&self, name: &str) {
        if let Err(e) = self.delete(name) {
            log::warn!("Rollback of {} failed: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::RecordingControlPlane;

    fn manager() -> (Arc<RecordingControlPlane>, InterfaceManager) {
        let cp = Arc::new(RecordingControlPlane::new());
        // no stale device on the host
        cp.fail_on("ip link show", "Device \"tun0\" does not exist.");
        let mgr = InterfaceManager::new(cp.clone());
        (cp, mgr)
    }

    #[test]
    fn test_create_sequence() {
        let (cp, mgr) = manager();
        let iface = mgr.create("tun0", 1500).unwrap();

        assert_eq!(iface.name(), "tun0");
        assert_eq!(iface.mtu(), 1500);
        assert!(iface.is_active());
        assert!(iface.data_path().is_none());
        assert_eq!(
            cp.calls(),
            vec![
                "ip link show tun0",
                "ip tuntap add dev tun0 mode tun",
                "ip link set dev tun0 mtu 1500",
                "ip link set dev tun0 up",
            ]
        );
    }

    #[test]
    fn test_create_preempts_stale_interface() {
        let cp = Arc::new(RecordingControlPlane::new());
        let mgr = InterfaceManager::new(cp.clone());

        mgr.create("tun0", 1500).unwrap();
        assert_eq!(cp.calls()[1], "ip tuntap del dev tun0 mode tun");
    }

    #[test]
    fn test_create_already_exists_when_preempt_fails() {
        let cp = Arc::new(RecordingControlPlane::new());
        cp.fail_on("ip tuntap del", "Operation not permitted");
        let mgr = InterfaceManager::new(cp.clone());

        let err = mgr.create("tun0", 1500).unwrap_err();
        assert!(matches!(err, SetupError::AlreadyExists(ref n) if n == "tun0"));
        assert!(cp.calls_starting_with("ip tuntap add").is_empty());
    }

    #[test]
    fn test_create_busy_device_is_already_exists() {
        let (cp, mgr) = manager();
        cp.fail_on("ip tuntap add", "ioctl(TUNSETIFF): Device or resource busy");

        let err = mgr.create("tun0", 1500).unwrap_err();
        assert!(matches!(err, SetupError::AlreadyExists(_)));
    }

    #[test]
    fn test_mtu_failure_rolls_back() {
        let (cp, mgr) = manager();
        cp.fail_on("mtu", "Invalid argument");

        let err = mgr.create("tun0", 1500).unwrap_err();
        assert!(matches!(err, SetupError::Configuration(_)));
        assert_eq!(
            cp.calls().last().map(String::as_str),
            Some("ip tuntap del dev tun0 mode tun")
        );
    }

    #[test]
    fn test_up_failure_rolls_back() {
        let (cp, mgr) = manager();
        cp.fail_on("ip link set dev tun0 up", "RTNETLINK answers: Operation not permitted");

        assert!(matches!(
            mgr.create("tun0", 1500),
            Err(SetupError::Configuration(_))
        ));
        assert_eq!(cp.calls_starting_with("ip tuntap del").len(), 1);
    }

    #[test]
    fn test_open_failure_rolls_back() {
        let (cp, mgr) = manager();
        cp.fail_open();

        assert!(matches!(
            mgr.create("tun0", 1500),
            Err(SetupError::Configuration(_))
        ));
        assert_eq!(cp.calls_starting_with("ip tuntap del").len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (cp, mgr) = manager();
        let mut iface = mgr.create("tun0", 1500).unwrap();
        cp.reset();

        mgr.close(&mut iface).unwrap();
        assert!(!iface.is_active());
        assert_eq!(cp.calls(), vec!["ip tuntap del dev tun0 mode tun"]);

        mgr.close(&mut iface).unwrap();
        assert_eq!(cp.calls().len(), 1);
    }

    #[test]
    fn test_close_failure_keeps_active() {
        let (cp, mgr) = manager();
        let mut iface = mgr.create("tun0", 1500).unwrap();
        cp.fail_on("ip tuntap del", "Device or resource busy");

        assert!(mgr.close(&mut iface).is_err());
        assert!(iface.is_active());
    }
}
