// Runners Module
// Uniform seams to external collaborators: shell commands and sidecar containers

pub mod container;
pub mod shell;

// Re-export key types
pub use container::{DockerBackend, SidecarBackend, SidecarError, SidecarHandle};
pub use shell::{Shell, ShellRunner};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One line of live command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub is_error: bool,
}

/// Receives output lines while the command is still running
pub type OutputSender = mpsc::UnboundedSender<OutputLine>;

/// A single external command invocation
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub shell: Shell,
    pub working_dir: PathBuf,
    /// Overrides applied on top of the inherited process environment
    pub env: BTreeMap<String, String>,
    /// `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Time between the polite termination signal and a forced kill
    pub kill_grace: Duration,
    /// Live output sink; the captured output is returned either way
    pub output: Option<OutputSender>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            shell: Shell::default(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            timeout: None,
            kill_grace: Duration::from_secs(10),
            output: None,
        }
    }
}

/// Captured result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or never started
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Set when the process could not be spawned at all
    pub spawn_error: Option<String>,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Runs an external command and captures exit code and output
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest, cancel: &CancellationToken) -> CommandOutput;
}
