// Shell Runner
// Executes step commands through a shell with timeouts and graceful termination

use super::{CommandOutput, CommandRequest, CommandRunner, OutputLine, OutputSender};

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    #[default]
    Default,
    /// Bash shell
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
    /// Windows PowerShell (falls back to pwsh off Windows)
    PowerShell,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-eo", "pipefail", "-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::PowerShell => {
                if cfg!(target_os = "windows") {
                    ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
        }
    }
}

impl std::str::FromStr for Shell {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sh" | "default" | "cmd" => Ok(Shell::Default),
            "bash" => Ok(Shell::Bash),
            "pwsh" => Ok(Shell::Pwsh),
            "powershell" => Ok(Shell::PowerShell),
            _ => Err(format!(
                "unknown shell '{}'. Valid shells: sh, bash, pwsh, powershell",
                s
            )),
        }
    }
}

enum WaitOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Shell runner for executing step commands
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn build_command(request: &CommandRequest) -> Command {
        let (shell_cmd, shell_args) = request.shell.get_command();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&request.command);
        cmd.current_dir(&request.working_dir);
        cmd.envs(&request.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group so termination reaches the whole command tree
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Terminate a child: SIGTERM to its process group, then kill after the grace period
    async fn terminate(child: &mut Child, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);

            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }

            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "failed to kill child process");
        }
    }

    /// Wait for the output readers once the shell itself is gone.
    ///
    /// Background processes the command started keep the pipes open, so the
    /// rest of the process group is terminated and the readers are given at
    /// most the grace period before they are stopped with what they have.
    async fn drain(
        pid: Option<u32>,
        readers: [Option<JoinHandle<String>>; 2],
        stop: &CancellationToken,
        grace: Duration,
    ) -> [String; 2] {
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = pid;

        let deadline = tokio::time::Instant::now() + grace;
        let mut outputs = [String::new(), String::new()];

        for (slot, reader) in outputs.iter_mut().zip(readers) {
            let Some(mut handle) = reader else {
                continue;
            };
            *slot = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    tracing::debug!("output pipes still open after the command exited");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                    stop.cancel();
                    handle.await.unwrap_or_default()
                }
            };
        }
        outputs
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    // ESRCH just means the whole group is already gone
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        if e != nix::errno::Errno::ESRCH {
            tracing::debug!(pid, ?signal, error = %e, "failed to signal process group");
        }
    }
}

/// Read a pipe to the end as raw bytes, forwarding each line as it arrives.
///
/// Invalid UTF-8 is replaced rather than ending the read, so the writer never
/// sees a closed pipe.
fn collect_output<R>(
    reader: R,
    is_error: bool,
    sink: Option<OutputSender>,
    stop: CancellationToken,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut output = String::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read,
                _ = stop.cancelled() => Ok(0),
            };

            let done = !matches!(read, Ok(n) if n > 0);
            if buf.is_empty() {
                if done {
                    break;
                }
                continue;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(line);

            if let Some(sink) = &sink {
                let _ = sink.send(OutputLine {
                    text: line.to_string(),
                    is_error,
                });
            }

            if done {
                break;
            }
        }
        output
    })
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: &CommandRequest, cancel: &CancellationToken) -> CommandOutput {
        let (shell_cmd, _) = request.shell.get_command();

        if cancel.is_cancelled() {
            return CommandOutput {
                cancelled: true,
                ..Default::default()
            };
        }

        let mut child = match Self::build_command(request).spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput {
                    spawn_error: Some(format!(
                        "failed to spawn shell process '{}': {}",
                        shell_cmd, e
                    )),
                    ..Default::default()
                };
            }
        };

        // The id is gone once the child is reaped, the group may outlive it
        let pid = child.id();
        let stop = CancellationToken::new();

        // Both streams were configured as piped in build_command
        let readers = [
            child
                .stdout
                .take()
                .map(|out| collect_output(out, false, request.output.clone(), stop.clone())),
            child
                .stderr
                .take()
                .map(|err| collect_output(err, true, request.output.clone(), stop.clone())),
        ];

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = sleep_or_forever(request.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let (exit_code, timed_out, cancelled) = match outcome {
            WaitOutcome::Exited(status) => (status.ok().and_then(|s| s.code()), false, false),
            WaitOutcome::TimedOut => {
                Self::terminate(&mut child, request.kill_grace).await;
                (None, true, false)
            }
            WaitOutcome::Cancelled => {
                Self::terminate(&mut child, request.kill_grace).await;
                (None, false, true)
            }
        };

        let [stdout, mut stderr] = Self::drain(pid, readers, &stop, request.kill_grace).await;

        if timed_out {
            if let Some(timeout) = request.timeout {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Process timed out after {:?}", timeout));
            }
        }

        CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled,
            spawn_error: None,
        }
    }
}
