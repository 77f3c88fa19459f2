// src/error.rs
use std::io;
use std::process::ExitStatus;

/// A failed external command: the full command line, how it exited and
/// whatever it printed on stdout/stderr.
#[derive(Debug, Clone, thiserror::Error)]
#[error("'{command}' {}{}", exit_summary(.status), output_suffix(.output))]
pub struct CommandError {
    pub command: String,
    pub status: Option<i32>,
    pub output: String,
}

impl CommandError {
    pub fn from_status(command: String, status: ExitStatus, output: String) -> Self {
        Self {
            command,
            status: status.code(),
            output,
        }
    }

    pub fn spawn_failed(command: String, err: &io::Error) -> Self {
        Self {
            command,
            status: None,
            output: err.to_string(),
        }
    }

    /// True when the tool reported that the object it was asked to create
    /// is already there.
    pub fn reports_existing(&self) -> bool {
        let out = self.output.to_lowercase();
        out.contains("exists") || out.contains("busy")
    }
}

fn exit_summary(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exited with {}", code),
        None => "could not be run".to_string(),
    }
}

fn output_suffix(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        String::new()
    } else {
        format!(", output: {}", output)
    }
}

/// Errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("this program must be run as root (effective uid {0})")]
    NotPrivileged(u32),

    #[error("interface {0} already exists and could not be removed")]
    AlreadyExists(String),

    #[error("interface configuration failed: {0}")]
    Configuration(String),

    #[error("failed to apply firewall rule: {0}")]
    RuleApply(#[source] CommandError),

    #[error("no IPv4 address found for {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("routing setup failed: {0}")]
    Routing(#[source] CommandError),

    #[error("unknown fingerprint profile '{0}' (expected windows, macos or linux)")]
    UnknownProfile(String),

    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),
}
