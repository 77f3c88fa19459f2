// src/control.rs
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use crate::error::{CommandError, SetupError};
use crate::rules::FirewallRule;
use crate::routing::RouteEntry;

const TUN_CLONE_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: u64 = 0x400454CA;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// One external command line. Arguments are passed to the program as-is,
/// never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Outcome of a best-effort teardown. Individual failures are logged as they
/// happen and only counted here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

impl CleanupReport {
    pub fn record(&mut self, what: &dyn fmt::Display, result: Result<(), CommandError>) {
        match result {
            Ok(()) => {
                log::info!("Removed: {}", what);
                self.removed += 1;
            }
            Err(e) => {
                log::warn!("Failed to remove {}: {}", what, e);
                self.failed += 1;
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Everything that touches host network configuration goes through this
/// trait. Implementors only provide the four primitives; the typed
/// operations are built on top of `run`.
pub trait NetworkControlPlane: Send + Sync {
    /// Runs a command and returns its combined stdout/stderr.
    fn run(&self, invocation: &Invocation) -> Result<String, CommandError>;

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Opens the character device backing `interface`. `Ok(None)` means the
    /// platform has no data-path handle to offer.
    fn open_data_path(&self, interface: &str) -> io::Result<Option<File>>;

    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;

    fn apply_firewall_rule(&self, rule: &FirewallRule) -> Result<(), CommandError> {
        self.run(&rule.append()).map(drop)
    }

    fn delete_firewall_rule(&self, rule: &FirewallRule) -> Result<(), CommandError> {
        self.run(&rule.delete()).map(drop)
    }

    fn add_route(&self, route: &RouteEntry) -> Result<(), CommandError> {
        self.run(&route.add()).map(drop)
    }

    fn delete_route(&self, route: &RouteEntry) -> Result<(), CommandError> {
        self.run(&route.delete()).map(drop)
    }

    fn ip(&self, args: &[&str]) -> Result<String, CommandError> {
        self.run(&Invocation::new("ip", args.iter().copied()))
    }

    fn set_kernel_parameter(&self, key: &str, value: &str) -> Result<(), CommandError> {
        self.run(&Invocation::new("sysctl", ["-w".to_string(), format!("{}={}", key, value)]))
            .map(drop)
    }

    /// Reads a kernel parameter, `None` when it is missing or unreadable.
    fn kernel_parameter(&self, key: &str) -> Option<String> {
        self.run(&Invocation::new("sysctl", ["-n", key]))
            .ok()
            .map(|out| out.trim().to_string())
    }

    fn set_link_mtu(&self, interface: &str, mtu: u16) -> Result<(), CommandError> {
        self.ip(&["link", "set", "dev", interface, "mtu", &mtu.to_string()])
            .map(drop)
    }

    /// First IPv4 address of `host`.
    fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, SetupError> {
        let addrs = self.resolve(host).map_err(|e| SetupError::Resolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        addrs
            .into_iter()
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| SetupError::Resolution {
                host: host.to_string(),
                reason: "only IPv6 addresses returned".to_string(),
            })
    }
}

/// The real host: shells out to `ip`, `iptables`, `sysctl` and friends.
pub struct HostControlPlane;

impl HostControlPlane {
    pub fn new() -> Self {
        Self
    }

    fn attach_tun(file: &File, interface: &str) -> io::Result<()> {
        #[repr(C)]
        struct IfReq {
            name: [u8; libc::IFNAMSIZ],
            flags: libc::c_short,
            _pad: [u8; 22],
        }

        if interface.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name too long: {}", interface),
            ));
        }

        let mut ifr = IfReq {
            name: [0u8; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        ifr.name[..interface.len()].copy_from_slice(interface.as_bytes());

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Default for HostControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkControlPlane for HostControlPlane {
    fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
        let line = invocation.to_string();
        log::debug!("exec: {}", line);

        let output = Command::new(invocation.program)
            .args(&invocation.args)
            .output()
            .map_err(|e| CommandError::spawn_failed(line.clone(), &e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(CommandError::from_status(line, output.status, combined))
        }
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn open_data_path(&self, interface: &str) -> io::Result<Option<File>> {
        let node = Path::new("/dev").join(interface);
        if let Ok(file) = OpenOptions::new().read(true).write(true).open(&node) {
            return Ok(Some(file));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_CLONE_DEVICE)?;
        Self::attach_tun(&file, interface)?;
        Ok(Some(file))
    }

    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 0u16).to_socket_addrs()?.map(|sa| sa.ip()).collect())
    }
}
