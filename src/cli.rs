// src/cli.rs
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug, Default)]
#[command(
    name = "tcp-fp-relay",
    about = "Relay TCP connections to a target while the host TCP stack imitates another OS fingerprint."
)]
pub struct Args {
    /// JSON config file; flags given on the command line override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Target host to connect to
    #[arg(long)]
    pub host: Option<String>,

    /// Target port to connect to
    #[arg(long)]
    pub port: Option<u16>,

    /// TUN interface name
    #[arg(long)]
    pub tun: Option<String>,

    /// Local port to listen on
    #[arg(long)]
    pub lport: Option<u16>,

    /// Capture relayed traffic to this pcap file
    #[arg(long, value_name = "PATH")]
    pub capture: Option<PathBuf>,

    /// Capture the first TCP handshake packets to this pcap file
    #[arg(long, value_name = "PATH")]
    pub handshake: Option<PathBuf>,

    /// TCP window size
    #[arg(long)]
    pub window: Option<u16>,

    /// IP time to live
    #[arg(long)]
    pub ttl: Option<u8>,

    /// Interface MTU
    #[arg(long)]
    pub mtu: Option<u16>,

    /// OS fingerprint to imitate (windows, macos, linux)
    #[arg(long)]
    pub fp: Option<String>,

    /// Print the SYN packets found in a pcap file and exit
    #[arg(long, value_name = "PATH")]
    pub analyze: Option<PathBuf>,
}

impl Args {
    /// Defaults, then the config file, then explicit flags.
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(host) = self.host {
            config.target_host = host;
        }
        if let Some(port) = self.port {
            config.target_port = port;
        }
        if let Some(tun) = self.tun {
            config.interface = tun;
        }
        if let Some(lport) = self.lport {
            config.local_port = lport;
        }
        if self.capture.is_some() {
            config.capture_file = self.capture;
        }
        if self.handshake.is_some() {
            config.handshake_file = self.handshake;
        }
        if let Some(window) = self.window {
            config.window_size = window;
        }
        if let Some(ttl) = self.ttl {
            config.ttl = ttl;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(fp) = self.fp {
            config.fingerprint = fp;
        }

        Ok(config)
    }
}
