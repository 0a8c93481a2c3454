// Execution Events
// Progress reporting and event types for a run

use crate::pipeline::models::{InstanceStatus, JobStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    RunStarted {
        run_name: String,
        total_jobs: usize,
        total_instances: usize,
    },

    /// Run completed
    RunCompleted {
        run_name: String,
        success: bool,
        cancelled: bool,
        duration: Duration,
    },

    /// All dependencies of a job succeeded
    JobReady { job_id: String },

    /// Job was skipped (failed or skipped dependency, or cancellation)
    JobSkipped { job_id: String, reason: String },

    /// Job reached a terminal status after running
    JobCompleted {
        job_id: String,
        status: JobStatus,
        duration: Duration,
    },

    /// Instance execution started
    InstanceStarted {
        job_id: String,
        instance_id: String,
        total_steps: usize,
    },

    /// Instance execution completed
    InstanceCompleted {
        job_id: String,
        instance_id: String,
        status: InstanceStatus,
        duration: Duration,
        reason: Option<String>,
    },

    /// Sidecar started and passed its health check
    SidecarReady {
        instance_id: String,
        service: String,
        image: String,
    },

    /// Sidecar torn down
    SidecarStopped { instance_id: String, service: String },

    /// Step execution started
    StepStarted {
        instance_id: String,
        step_name: String,
        step_index: usize,
    },

    /// Captured step output (stdout/stderr)
    StepOutput {
        instance_id: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        instance_id: String,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (earlier failure or cancellation)
    StepSkipped {
        instance_id: String,
        step_name: String,
        step_index: usize,
        reason: String,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(name: impl Into<String>, total_jobs: usize, total_instances: usize) -> Self {
        Self::RunStarted {
            run_name: name.into(),
            total_jobs,
            total_instances,
        }
    }

    pub fn run_completed(
        name: impl Into<String>,
        success: bool,
        cancelled: bool,
        duration: Duration,
    ) -> Self {
        Self::RunCompleted {
            run_name: name.into(),
            success,
            cancelled,
            duration,
        }
    }

    pub fn job_skipped(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobSkipped {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    pub fn job_completed(job_id: impl Into<String>, status: JobStatus, duration: Duration) -> Self {
        Self::JobCompleted {
            job_id: job_id.into(),
            status,
            duration,
        }
    }

    pub fn step_started(
        instance_id: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            instance_id: instance_id.into(),
            step_name: step_name.into(),
            step_index,
        }
    }

    pub fn step_output(
        instance_id: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            instance_id: instance_id.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_skipped(
        instance_id: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            instance_id: instance_id.into(),
            step_name: step_name.into(),
            step_index,
            reason: reason.into(),
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::run_started("ci", 2, 3));
        tx.send_event(ExecutionEvent::job_skipped("deploy", "dependency 'test' failed"));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(
            event1,
            ExecutionEvent::RunStarted {
                total_instances: 3,
                ..
            }
        ));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::JobSkipped { .. }));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = progress_channel();
        drop(rx);

        // Should not panic
        tx.send_event(ExecutionEvent::warning("late", None));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::error("test", Some("lint".to_string())));
    }
}
