// src/recorder.rs
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const CAPTURE_PROGRAM: &str = "tcpdump";
const CAPTURE_START_DELAY: Duration = Duration::from_secs(2);
const HANDSHAKE_PACKETS: &str = "10";
const HANDSHAKE_FILTER: &str = "tcp[tcpflags] & (tcp-syn|tcp-ack) != 0";
const SYN_FILTER: &str = "tcp.flags.syn==1 && tcp.flags.ack==0";

fn capture_args(interface: &str, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        interface.to_string(),
        "-w".to_string(),
        output.display().to_string(),
        "-v".to_string(),
        "tcp".to_string(),
    ]
}

fn handshake_args(interface: &str, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        interface.to_string(),
        "-w".to_string(),
        output.display().to_string(),
        "-v".to_string(),
        HANDSHAKE_FILTER.to_string(),
        "-c".to_string(),
        HANDSHAKE_PACKETS.to_string(),
    ]
}

fn analyze_args(pcap: &Path) -> Vec<String> {
    let mut args = vec![
        "-r".to_string(),
        pcap.display().to_string(),
        "-Y".to_string(),
        SYN_FILTER.to_string(),
        "-T".to_string(),
        "fields".to_string(),
    ];
    for field in ["ip.src", "ip.dst", "tcp.window_size", "ip.ttl", "tcp.options"] {
        args.push("-e".to_string());
        args.push(field.to_string());
    }
    args
}

/// Sends SIGINT so tcpdump flushes the capture file before exiting.
fn interrupt(child: &Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A running capture. `stop` asks tcpdump to finish, `join` waits for it.
pub struct CaptureHandle {
    output: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<Option<ExitStatus>>>,
}

impl CaptureHandle {
    /// Runs `command` under supervision until it exits, `limit` elapses or
    /// `stop` is called.
    fn spawn(command: Command, output: PathBuf, limit: Option<Duration>) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move { supervise(command, limit, stop_rx).await.map(Some) });
        Self {
            output,
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// `Ok(None)` when the capture was stopped before tcpdump was started.
    pub async fn join(mut self) -> Result<Option<ExitStatus>> {
        (&mut self.task).await.context("capture task failed")?
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One SYN seen in a capture, as reported by tshark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynObservation {
    pub src: String,
    pub dst: String,
    pub window: Option<u32>,
    pub ttl: Option<u8>,
    pub options: String,
}

impl SynObservation {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let src = fields.next()?.trim();
        if src.is_empty() {
            return None;
        }
        let dst = fields.next().unwrap_or("").trim();
        let window = fields.next().and_then(|v| v.trim().parse().ok());
        let ttl = fields.next().and_then(|v| v.trim().parse().ok());
        let options = fields.next().unwrap_or("").trim();

        Some(Self {
            src: src.to_string(),
            dst: dst.to_string(),
            window,
            ttl,
            options: options.to_string(),
        })
    }
}

impl fmt::Display for SynObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)?;
        if let Some(window) = self.window {
            write!(f, " win={}", window)?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, " ttl={}", ttl)?;
        }
        if !self.options.is_empty() {
            write!(f, " opts={}", self.options)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub raw: String,
    pub syns: Vec<SynObservation>,
}

impl AnalysisReport {
    pub fn parse(raw: String) -> Self {
        let syns = raw.lines().filter_map(SynObservation::parse).collect();
        Self { raw, syns }
    }
}

/// Thin wrapper around tcpdump and tshark. Nothing here feeds back into
/// the network setup.
pub struct TrafficRecorder;

impl TrafficRecorder {
    pub fn new() -> Self {
        Self
    }

    pub fn start_capture(&self, interface: &str, output: &Path) -> Result<CaptureHandle> {
        create_parent(output)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_capture(
            interface.to_string(),
            output.to_path_buf(),
            stop_rx,
        ));

        log::info!("Capturing traffic on {} to {}", interface, output.display());
        Ok(CaptureHandle {
            output: output.to_path_buf(),
            stop_tx: Some(stop_tx),
            task,
        })
    }

    /// Captures up to ten SYN/ACK-flagged packets, giving up after `duration`.
    pub fn capture_handshake(&self, interface: &str, output: &Path, duration: Duration) -> Result<CaptureHandle> {
        create_parent(output)?;
        log::info!(
            "Capturing TCP handshake on {} to {}",
            interface,
            output.display()
        );

        let mut command = Command::new(CAPTURE_PROGRAM);
        command.args(handshake_args(interface, output));
        Ok(CaptureHandle::spawn(
            command,
            output.to_path_buf(),
            Some(duration),
        ))
    }

    pub async fn analyze(&self, pcap: &Path) -> Result<AnalysisReport> {
        if tokio::fs::metadata(pcap).await.is_err() {
            anyhow::bail!("pcap file does not exist: {}", pcap.display());
        }

        let output = Command::new("tshark")
            .args(analyze_args(pcap))
            .output()
            .await
            .context("failed to run tshark")?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            anyhow::bail!("failed to analyze {}: {}, output: {}", pcap.display(), output.status, text.trim());
        }

        Ok(AnalysisReport::parse(text))
    }
}

impl Default for TrafficRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn create_parent(output: &Path) -> Result<()> {
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

async fn run_capture(
    interface: String,
    output: PathBuf,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<Option<ExitStatus>> {
    tokio::select! {
        _ = sleep(CAPTURE_START_DELAY) => {}
        _ = &mut stop_rx => return Ok(None),
    }

    let exists = Command::new("ip")
        .args(["link", "show", &interface])
        .output()
        .await
        .context("failed to run ip")?;
    if !exists.status.success() {
        anyhow::bail!("interface {} does not exist", interface);
    }

    let mut command = Command::new(CAPTURE_PROGRAM);
    command.args(capture_args(&interface, &output));
    supervise(command, None, stop_rx).await.map(Some)
}

/// Waits for the capture process, interrupting it when `limit` elapses or a
/// stop is requested. tcpdump may exit with 1 after SIGINT; that still
/// counts as a finished capture.
async fn supervise(
    mut command: Command,
    limit: Option<Duration>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<ExitStatus> {
    let mut child = command
        .kill_on_drop(true)
        .spawn()
        .context("failed to start capture process")?;
    log::info!("Capture process started with pid {:?}", child.id());

    let deadline = async {
        match limit {
            Some(limit) => sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let (status, interrupted) = tokio::select! {
        status = child.wait() => (status?, false),
        _ = deadline => {
            log::info!("Stopping capture after {:?}", limit.unwrap_or_default());
            interrupt(&child)?;
            (child.wait().await?, true)
        }
        _ = &mut stop_rx => {
            interrupt(&child)?;
            (child.wait().await?, true)
        }
    };

    if status.success() || (interrupted && status.code() == Some(1)) {
        log::info!("Capture finished");
        Ok(status)
    } else {
        anyhow::bail!("capture process exited with {}", status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_args() {
        let args = capture_args("tun0", Path::new("/tmp/out.pcap"));
        assert_eq!(args, vec!["-i", "tun0", "-w", "/tmp/out.pcap", "-v", "tcp"]);

        let args = handshake_args("tun0", Path::new("hs.pcap"));
        assert_eq!(args[5], "tcp[tcpflags] & (tcp-syn|tcp-ack) != 0");
        assert_eq!(&args[6..], &["-c", "10"]);
    }

    #[test]
    fn test_analyze_args() {
        let args = analyze_args(Path::new("cap.pcap"));
        assert_eq!(&args[..4], &["-r", "cap.pcap", "-Y", SYN_FILTER]);
        assert_eq!(args.iter().filter(|a| *a == "-e").count(), 5);
        assert_eq!(args.last().map(String::as_str), Some("tcp.options"));
    }

    #[test]
    fn test_report_parse() {
        let raw = "10.0.0.2\t93.184.216.34\t8192\t128\t02:04:05:b4,01,03:03:08\n\
                   \n\
                   10.0.0.2\t93.184.216.34\t\t\t\n"
            .to_string();
        let report = AnalysisReport::parse(raw);

        assert_eq!(report.syns.len(), 2);
        assert_eq!(report.syns[0].window, Some(8192));
        assert_eq!(report.syns[0].ttl, Some(128));
        assert_eq!(report.syns[0].options, "02:04:05:b4,01,03:03:08");
        assert_eq!(report.syns[1].window, None);
        assert_eq!(report.syns[1].to_string(), "10.0.0.2 -> 93.184.216.34");
    }

    #[tokio::test]
    async fn test_analyze_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrafficRecorder::new()
            .analyze(&dir.path().join("missing.pcap"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn test_exit_one_after_time_limit_is_success() {
        let handle = CaptureHandle::spawn(
            shell("trap 'exit 1' INT; sleep 5 & wait"),
            PathBuf::from("hs.pcap"),
            Some(Duration::from_millis(300)),
        );
        let status = handle.join().await.unwrap().unwrap();
        assert_eq!(status.code(), Some(1));
    }

    #[tokio::test]
    async fn test_stop_while_running() {
        let mut handle = CaptureHandle::spawn(
            shell("trap 'exit 0' INT; sleep 5 & wait"),
            PathBuf::from("cap.pcap"),
            None,
        );
        sleep(Duration::from_millis(300)).await;
        handle.stop();

        let status = handle.join().await.unwrap().unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_capture_process_failure() {
        let handle = CaptureHandle::spawn(shell("exit 3"), PathBuf::from("cap.pcap"), None);
        let err = handle.join().await.unwrap_err();
        assert!(err.to_string().contains("exited with"));

        // exit 1 is only accepted once the process was interrupted
        let handle = CaptureHandle::spawn(
            shell("exit 1"),
            PathBuf::from("cap.pcap"),
            Some(Duration::from_secs(5)),
        );
        assert!(handle.join().await.is_err());
    }

    #[tokio::test]
    async fn test_capture_program_missing() {
        let handle = CaptureHandle::spawn(
            Command::new("/nonexistent/tcpdump"),
            PathBuf::from("cap.pcap"),
            None,
        );
        let err = handle.join().await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/capture.pcap");

        let mut handle = TrafficRecorder::new()
            .start_capture("tun-test0", &output)
            .unwrap();
        assert!(output.parent().unwrap().is_dir());
        assert_eq!(handle.output(), output.as_path());

        handle.stop();
        assert!(handle.join().await.unwrap().is_none());
    }
}
