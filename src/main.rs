use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

mod cli;
mod config;
mod control;
mod error;
mod fingerprint;
mod interface;
mod recorder;
mod relay;
mod routing;
mod rules;
mod session;

use cli::Args;
use control::HostControlPlane;
use error::SetupError;
use recorder::{CaptureHandle, TrafficRecorder};
use relay::ConnectionRelay;
use session::SystemNetworkState;

#[cfg(all(unix, not(target_env = "musl")))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

const HANDSHAKE_DURATION: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = Args::parse();
    if let Some(pcap) = args.analyze.take() {
        return analyze(&pcap).await;
    }

    let config = args.into_config()?;
    config.validate()?;

    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(SetupError::NotPrivileged(euid).into());
    }

    log::info!("=================================================");
    log::info!("TCP fingerprint relay v{}", env!("CARGO_PKG_VERSION"));
    log::info!("=================================================");
    log::info!("Target: {}:{}", config.target_host, config.target_port);
    log::info!("Interface: {} (mtu {})", config.interface, config.mtu);
    log::info!(
        "Profile: {} (window {}, ttl {})",
        config.fingerprint,
        config.window_size,
        config.ttl
    );
    log::info!("=================================================");

    let control = Arc::new(HostControlPlane::new());
    let mut state = SystemNetworkState::acquire(control, &config)?;
    log::info!(
        "Marked traffic to {} uses table {} via {}, {} firewall rules active",
        state.policy().target,
        state.policy().table,
        state.interface().name(),
        state.applied_rules().len()
    );
    log::debug!("Active fingerprint: {:?}", state.profile());
    log::debug!(
        "Interface {} active: {}, mtu {}, data path open: {}",
        state.interface().name(),
        state.interface().is_active(),
        state.interface().mtu(),
        state.interface().data_path().is_some()
    );

    let recorder = TrafficRecorder::new();
    let capture = config
        .capture_file
        .as_deref()
        .and_then(|path| started(recorder.start_capture(&config.interface, path)));
    let handshake = config.handshake_file.as_deref().and_then(|path| {
        started(recorder.capture_handshake(&config.interface, path, HANDSHAKE_DURATION))
    });

    let relay = ConnectionRelay::new(&config.target_host, config.target_port);
    let handle = match relay.start(config.local_port).await {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Failed to start relay: {}", e);
            finish_capture(capture).await;
            finish_capture(handshake).await;
            state.release();
            return Err(e.into());
        }
    };
    state.mark_connected();

    let session = state.session();
    log::info!("✓ Relaying {} -> {}:{}", handle.local_addr(), session.target_host, session.target_port);
    log::info!("Ready, press Ctrl+C to stop");

    wait_for_shutdown().await;

    log::info!("Shutting down...");
    tokio::time::sleep(config.settle_delay()).await;

    finish_capture(capture).await;
    finish_capture(handshake).await;

    if handle.is_finished() {
        log::warn!("Accept loop had already stopped");
    }
    handle.abort();
    handle.join().await;

    let report = state.release();
    let (before, _) = state.snapshots();
    log::info!("TCP settings are left as applied, previous values: {}", before);
    if report.is_clean() {
        log::info!("✓ Cleanup complete ({} items removed)", report.removed);
    } else {
        log::warn!(
            "Cleanup finished with {} failure(s), {} items removed",
            report.failed,
            report.removed
        );
    }

    Ok(())
}

fn started(result: Result<CaptureHandle>) -> Option<CaptureHandle> {
    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("Failed to start capture: {:#}", e);
            None
        }
    }
}

/// Stops a capture and waits until the pcap is written.
async fn finish_capture(capture: Option<CaptureHandle>) {
    let Some(mut capture) = capture else {
        return;
    };
    capture.stop();
    let output = capture.output().to_path_buf();
    match capture.join().await {
        Ok(Some(status)) => log::info!("Capture saved to {} ({})", output.display(), status),
        Ok(None) => log::info!("Capture to {} stopped before tcpdump started", output.display()),
        Err(e) => log::warn!("Capture to {} failed: {:#}", output.display(), e),
    }
}

async fn wait_for_shutdown() {
    let mut term = match unix_signal(SignalKind::terminate()) {
        Ok(term) => Some(term),
        Err(e) => {
            log::warn!("Failed to listen for SIGTERM: {}", e);
            None
        }
    };

    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => log::info!("Received SIGINT"),
            Err(e) => log::error!("Failed to listen for SIGINT: {}", e),
        },
        _ = async {
            match term.as_mut() {
                Some(term) => { term.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => log::info!("Received SIGTERM"),
    }
}

async fn analyze(pcap: &Path) -> Result<()> {
    let report = TrafficRecorder::new().analyze(pcap).await?;
    log::debug!("tshark output:\n{}", report.raw.trim_end());
    if report.syns.is_empty() {
        log::info!("No SYN packets found in {}", pcap.display());
        return Ok(());
    }

    log::info!("SYN packets in {}:", pcap.display());
    for syn in &report.syns {
        log::info!("  {}", syn);
    }
    Ok(())
}
