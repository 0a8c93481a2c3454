// Step Runner
// Runs the ordered steps of one job instance inside a fresh, isolated workspace

use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::matrix::JobInstance;
use super::sidecar::SidecarManager;
use crate::pipeline::models::{InstanceResult, InstanceStatus, StepDefinition, StepOutcome, StepStatus};
use crate::runners::container::SidecarError;
use crate::runners::{CommandRequest, CommandRunner, OutputLine};
use crate::settings::EngineSettings;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CANCELLED: &str = "cancelled";

/// Executes job instances step by step
#[derive(Clone)]
pub struct StepRunner {
    command_runner: Arc<dyn CommandRunner>,
    sidecars: SidecarManager,
    settings: EngineSettings,
    /// Project directory exported as `GANTRY_SOURCE_DIR`
    source_dir: PathBuf,
    /// Run-level environment
    base_env: BTreeMap<String, String>,
    event_tx: Option<ProgressSender>,
}

impl StepRunner {
    pub fn new(
        command_runner: Arc<dyn CommandRunner>,
        sidecars: SidecarManager,
        settings: EngineSettings,
    ) -> Self {
        Self {
            command_runner,
            sidecars,
            settings,
            source_dir: PathBuf::from("."),
            base_env: BTreeMap::new(),
            event_tx: None,
        }
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run one instance to a terminal status.
    ///
    /// Sidecars are released and the workspace removed before this returns,
    /// whatever the outcome.
    pub async fn run(&self, instance: &JobInstance, cancel: &CancellationToken) -> InstanceResult {
        let start = Instant::now();
        let mut result =
            InstanceResult::pending(&instance.id, instance.job_id(), instance.selection.clone());

        if cancel.is_cancelled() {
            return self.finish_skipped(instance, result, CANCELLED, start);
        }

        result.transition(InstanceStatus::Running);
        self.event_tx.send_event(ExecutionEvent::InstanceStarted {
            job_id: instance.job_id().to_string(),
            instance_id: instance.id.clone(),
            total_steps: instance.steps.len(),
        });

        let workspace = match tempfile::Builder::new()
            .prefix("gantry-")
            .tempdir_in(self.settings.workspace_parent())
        {
            Ok(dir) => dir,
            Err(e) => {
                let reason = format!("failed to create workspace: {}", e);
                tracing::error!(instance = %instance.id, error = %e, "failed to create workspace");
                return self.finish_failed(instance, result, reason, start);
            }
        };
        tracing::debug!(instance = %instance.id, workspace = %workspace.path().display(), "created workspace");

        if instance.template.checkout {
            let skip = self.settings.workspace_parent();
            match copy_source(&self.source_dir, workspace.path(), &skip).await {
                Ok(files) => {
                    tracing::debug!(instance = %instance.id, files, "checked out source");
                }
                Err(e) => {
                    let reason = format!("failed to check out source: {}", e);
                    tracing::error!(instance = %instance.id, error = %e, "failed to check out source");
                    close_workspace(workspace, &instance.id);
                    return self.finish_failed(instance, result, reason, start);
                }
            }
        }

        let guard = match self
            .sidecars
            .acquire(&instance.id, instance.sidecars(), cancel)
            .await
        {
            Ok(guard) => guard,
            Err(SidecarError::Cancelled) => {
                close_workspace(workspace, &instance.id);
                return self.finish_skipped(instance, result, CANCELLED, start);
            }
            Err(e) => {
                close_workspace(workspace, &instance.id);
                return self.finish_failed(instance, result, e.to_string(), start);
            }
        };

        let mut env = self.base_env.clone();
        env.extend(instance.env.clone());
        env.insert(
            "GANTRY_WORKSPACE".to_string(),
            workspace.path().display().to_string(),
        );
        env.insert(
            "GANTRY_SOURCE_DIR".to_string(),
            self.source_dir.display().to_string(),
        );
        env.insert("GANTRY_JOB".to_string(), instance.job_id().to_string());
        env.insert("GANTRY_INSTANCE".to_string(), instance.id.clone());
        env.extend(guard.connection_env());

        let mut failed = false;
        let mut stop_reason: Option<&str> = None;

        for (index, step) in instance.steps.iter().enumerate() {
            if stop_reason.is_none() && cancel.is_cancelled() {
                stop_reason = Some(CANCELLED);
            }

            if let Some(reason) = stop_reason {
                self.event_tx.send_event(ExecutionEvent::step_skipped(
                    &instance.id,
                    &step.name,
                    index,
                    reason,
                ));
                result.steps.push(StepOutcome::skipped(&step.name, reason));
                continue;
            }

            let outcome = self
                .execute_step(instance, index, step, &env, workspace.path(), cancel)
                .await;

            match outcome.status {
                StepStatus::Failed => {
                    failed = true;
                    if !step.continue_on_error {
                        stop_reason = Some("previous step failed");
                    }
                }
                StepStatus::Skipped => stop_reason = Some(CANCELLED),
                StepStatus::Succeeded => {}
            }

            result.steps.push(outcome);
        }

        guard.release().await;
        close_workspace(workspace, &instance.id);

        let status = if failed {
            InstanceStatus::Failed
        } else if stop_reason == Some(CANCELLED) {
            InstanceStatus::Skipped
        } else {
            InstanceStatus::Succeeded
        };

        result.reason = match status {
            InstanceStatus::Failed => result.failed_steps().next().map(StepOutcome::failure_reason),
            InstanceStatus::Skipped => Some(CANCELLED.to_string()),
            _ => None,
        };
        result.transition(status);
        self.complete(instance, result, start)
    }

    /// Execute a single step
    async fn execute_step(
        &self,
        instance: &JobInstance,
        index: usize,
        step: &StepDefinition,
        env: &BTreeMap<String, String>,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let start = Instant::now();

        let working_dir = match &step.working_directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => {
                let dir = workspace.join(dir);
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    tracing::warn!(instance = %instance.id, dir = %dir.display(), error = %e, "failed to create working directory");
                }
                dir
            }
            None => workspace.to_path_buf(),
        };

        let mut request = CommandRequest::new(&step.command, working_dir);
        request.shell = step.shell;
        request.env = env.clone();
        request.env.extend(step.env.clone());
        request.timeout = step.timeout;
        request.kill_grace = self.settings.kill_grace();

        // Variable names only, values may be secrets
        let env_keys: Vec<&String> = request.env.keys().collect();
        tracing::debug!(instance = %instance.id, step = %step.name, env_keys = ?env_keys, "running step");

        self.event_tx
            .send_event(ExecutionEvent::step_started(&instance.id, &step.name, index));

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if self.event_tx.is_some() {
            request.output = Some(line_tx);
        }

        let mut streamed = false;
        let output = {
            let run = self.command_runner.run(&request, cancel);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    output = &mut run => break output,
                    Some(line) = line_rx.recv() => {
                        streamed = true;
                        self.forward_line(instance, index, line);
                    }
                }
            }
        };
        while let Ok(line) = line_rx.try_recv() {
            streamed = true;
            self.forward_line(instance, index, line);
        }
        let duration = start.elapsed();

        // Runners that only capture get their output reported in one piece
        if !streamed {
            for (text, is_error) in [(&output.stdout, false), (&output.stderr, true)] {
                if !text.is_empty() {
                    self.event_tx.send_event(ExecutionEvent::step_output(
                        &instance.id,
                        index,
                        text,
                        is_error,
                    ));
                }
            }
        }

        let (status, error) = if output.cancelled {
            (StepStatus::Skipped, Some(CANCELLED.to_string()))
        } else if let Some(error) = &output.spawn_error {
            (StepStatus::Failed, Some(error.clone()))
        } else if output.timed_out {
            let limit = step.timeout.unwrap_or_default();
            (StepStatus::Failed, Some(format!("timed out after {:?}", limit)))
        } else if output.success() {
            (StepStatus::Succeeded, None)
        } else {
            (StepStatus::Failed, None)
        };

        match status {
            StepStatus::Failed => tracing::info!(
                instance = %instance.id,
                step = %step.name,
                exit_code = ?output.exit_code,
                timed_out = output.timed_out,
                "step failed"
            ),
            _ => tracing::debug!(instance = %instance.id, step = %step.name, ?duration, "step finished"),
        }

        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            instance_id: instance.id.clone(),
            step_name: step.name.clone(),
            step_index: index,
            status,
            duration,
            exit_code: output.exit_code,
        });

        StepOutcome {
            name: step.name.clone(),
            status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
            error,
            timed_out: output.timed_out,
        }
    }

    fn forward_line(&self, instance: &JobInstance, index: usize, line: OutputLine) {
        self.event_tx.send_event(ExecutionEvent::step_output(
            &instance.id,
            index,
            &line.text,
            line.is_error,
        ));
    }

    fn finish_skipped(
        &self,
        instance: &JobInstance,
        mut result: InstanceResult,
        reason: &str,
        start: Instant,
    ) -> InstanceResult {
        result.steps = skip_all(instance, reason);
        result.reason = Some(reason.to_string());
        result.transition(InstanceStatus::Skipped);
        self.complete(instance, result, start)
    }

    fn finish_failed(
        &self,
        instance: &JobInstance,
        mut result: InstanceResult,
        reason: String,
        start: Instant,
    ) -> InstanceResult {
        result.steps = skip_all(instance, "instance setup failed");
        result.reason = Some(reason);
        result.transition(InstanceStatus::Failed);
        self.complete(instance, result, start)
    }

    fn complete(
        &self,
        instance: &JobInstance,
        mut result: InstanceResult,
        start: Instant,
    ) -> InstanceResult {
        result.duration = start.elapsed();
        tracing::debug!(instance = %instance.id, status = ?result.status, "instance finished");

        self.event_tx.send_event(ExecutionEvent::InstanceCompleted {
            job_id: instance.job_id().to_string(),
            instance_id: instance.id.clone(),
            status: result.status,
            duration: result.duration,
            reason: result.reason.clone(),
        });
        result
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("sidecars", &self.sidecars)
            .field("settings", &self.settings)
            .field("source_dir", &self.source_dir)
            .finish()
    }
}

fn skip_all(instance: &JobInstance, reason: &str) -> Vec<StepOutcome> {
    instance
        .steps
        .iter()
        .map(|step| StepOutcome::skipped(&step.name, reason))
        .collect()
}

/// Copy the project source into a workspace, leaving out `.git` and the
/// directory workspaces are created in. Returns the number of files copied.
async fn copy_source(source: &Path, dest: &Path, skip: &Path) -> std::io::Result<u64> {
    let source = tokio::fs::canonicalize(source).await?;
    let skip = tokio::fs::canonicalize(skip).await.ok();

    let mut pending = vec![(source, dest.to_path_buf())];
    let mut copied = 0;

    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_name() == ".git" || skip.as_deref() == Some(path.as_path()) {
                continue;
            }

            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((path, target));
            } else if file_type.is_symlink() {
                #[cfg(unix)]
                tokio::fs::symlink(tokio::fs::read_link(&path).await?, &target).await?;
            } else {
                tokio::fs::copy(&path, &target).await?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

fn close_workspace(workspace: tempfile::TempDir, instance_id: &str) {
    let path = workspace.path().to_path_buf();
    if let Err(e) = workspace.close() {
        tracing::warn!(instance = instance_id, workspace = %path.display(), error = %e, "failed to remove workspace");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::execution::sidecar::tests::FakeBackend;
    use crate::pipeline::models::{JobTemplate, MatrixSpec, SidecarSpec};
    use crate::runners::container::SidecarBackend;
    use crate::runners::CommandOutput;

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Command runner answering from a script; unknown commands exit 0
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        pub outputs: HashMap<String, CommandOutput>,
        pub requests: Mutex<Vec<CommandRequest>>,
    }

    impl ScriptedRunner {
        pub(crate) fn with(mut self, command: &str, output: CommandOutput) -> Self {
            self.outputs.insert(command.to_string(), output);
            self
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.command.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, request: &CommandRequest, _cancel: &CancellationToken) -> CommandOutput {
            self.requests.lock().unwrap().push(request.clone());
            self.outputs
                .get(&request.command)
                .cloned()
                .unwrap_or_else(|| CommandOutput::exited(0, "ok", ""))
        }
    }

    fn runner(commands: &Arc<ScriptedRunner>) -> StepRunner {
        let commands: Arc<dyn CommandRunner> = commands.clone();
        StepRunner::new(
            commands,
            SidecarManager::new(None, Duration::from_millis(10)),
            EngineSettings::default(),
        )
    }

    fn instance(template: JobTemplate) -> JobInstance {
        MatrixExpander::expand(&Arc::new(template))
            .unwrap()
            .remove(0)
    }

    fn three_steps() -> JobTemplate {
        JobTemplate::new("build")
            .with_step(StepDefinition::new("one", "step-one"))
            .with_step(StepDefinition::new("two", "step-two"))
            .with_step(StepDefinition::new("three", "step-three"))
    }

    fn statuses(result: &InstanceResult) -> Vec<StepStatus> {
        result.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let commands = Arc::new(ScriptedRunner::default());

        let result = runner(&commands)
            .run(&instance(three_steps()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, InstanceStatus::Succeeded);
        assert_eq!(statuses(&result), vec![StepStatus::Succeeded; 3]);
        assert_eq!(commands.commands(), vec!["step-one", "step-two", "step-three"]);
        assert!(result.reason.is_none());
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let commands = Arc::new(
            ScriptedRunner::default().with("step-two", CommandOutput::exited(2, "", "boom")),
        );

        let result = runner(&commands)
            .run(&instance(three_steps()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Skipped]
        );
        assert_eq!(commands.commands(), vec!["step-one", "step-two"]);
        assert_eq!(result.steps[1].stderr, "boom");
        assert_eq!(
            result.reason.as_deref(),
            Some("step 'two' exited with code 2")
        );
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_next_step() {
        let template = JobTemplate::new("build")
            .with_step(StepDefinition::new("one", "step-one").continue_on_error(true))
            .with_step(StepDefinition::new("two", "step-two"));
        let commands = Arc::new(
            ScriptedRunner::default().with("step-one", CommandOutput::exited(1, "", "")),
        );

        let result = runner(&commands)
            .run(&instance(template), &CancellationToken::new())
            .await;

        assert_eq!(
            statuses(&result),
            vec![StepStatus::Failed, StepStatus::Succeeded]
        );
        assert_eq!(result.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_fails_step() {
        let timed_out = CommandOutput {
            timed_out: true,
            ..Default::default()
        };
        let template = JobTemplate::new("build").with_step(
            StepDefinition::new("slow", "sleep 100").with_timeout(Duration::from_secs(1)),
        );
        let commands = Arc::new(ScriptedRunner::default().with("sleep 100", timed_out));

        let result = runner(&commands)
            .run(&instance(template), &CancellationToken::new())
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.steps[0].timed_out);
        assert_eq!(result.reason.as_deref(), Some("step 'slow' timed out"));
    }

    #[tokio::test]
    async fn test_environment_precedence() {
        let template = JobTemplate::new("test")
            .with_env("LEVEL", "job")
            .with_env("JOB_ONLY", "yes")
            .with_matrix(MatrixSpec::new().axis("python", ["3.9"]))
            .with_step(StepDefinition::new("env", "env").with_env("LEVEL", "step"));
        let commands = Arc::new(ScriptedRunner::default());

        let mut base = BTreeMap::new();
        base.insert("LEVEL".to_string(), "run".to_string());
        base.insert("RUN_ONLY".to_string(), "yes".to_string());

        runner(&commands)
            .with_env(base)
            .with_source_dir("/src/project")
            .run(&instance(template), &CancellationToken::new())
            .await;

        let requests = commands.requests.lock().unwrap();
        let env = &requests[0].env;
        assert_eq!(env["LEVEL"], "step");
        assert_eq!(env["JOB_ONLY"], "yes");
        assert_eq!(env["RUN_ONLY"], "yes");
        assert_eq!(env["MATRIX_PYTHON"], "3.9");
        assert_eq!(env["GANTRY_SOURCE_DIR"], "/src/project");
        assert_eq!(env["GANTRY_INSTANCE"], "test (python=3.9)");
        assert_eq!(env["GANTRY_WORKSPACE"], requests[0].working_dir.display().to_string());
    }

    #[tokio::test]
    async fn test_workspace_is_fresh_and_removed() {
        let template = JobTemplate::new("build")
            .with_step(StepDefinition::new("one", "a"))
            .with_step(StepDefinition::new("two", "b").with_working_directory("sub"));
        let commands = Arc::new(ScriptedRunner::default());
        let runner = runner(&commands);
        let instance = instance(template);

        runner.run(&instance, &CancellationToken::new()).await;
        runner.run(&instance, &CancellationToken::new()).await;

        let requests = commands.requests.lock().unwrap();
        assert_ne!(requests[0].working_dir, requests[2].working_dir);
        assert_eq!(requests[1].working_dir, requests[0].working_dir.join("sub"));
        assert!(requests
            .iter()
            .all(|r| !r.working_dir.exists()));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let commands = Arc::new(ScriptedRunner::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner(&commands)
            .run(&instance(three_steps()), &cancel)
            .await;

        assert_eq!(result.status, InstanceStatus::Skipped);
        assert_eq!(statuses(&result), vec![StepStatus::Skipped; 3]);
        assert!(commands.commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_mid_step() {
        let interrupted = CommandOutput {
            cancelled: true,
            ..Default::default()
        };
        let commands = Arc::new(ScriptedRunner::default().with("step-two", interrupted));

        let result = runner(&commands)
            .run(&instance(three_steps()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, InstanceStatus::Skipped);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Succeeded, StepStatus::Skipped, StepStatus::Skipped]
        );
        assert_eq!(result.steps[1].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_sidecar_timeout_fails_before_steps() {
        let backend = Arc::new(FakeBackend::default());
        let sidecar_backend: Arc<dyn SidecarBackend> = backend.clone();
        let commands = Arc::new(ScriptedRunner::default());
        let command_runner: Arc<dyn CommandRunner> = commands.clone();

        let runner = StepRunner::new(
            command_runner,
            SidecarManager::new(Some(sidecar_backend), Duration::from_millis(10)),
            EngineSettings::default(),
        );
        let template = three_steps().with_sidecar(
            SidecarSpec::new("db", "postgres").with_readiness_timeout(Duration::from_millis(50)),
        );

        let result = runner
            .run(&instance(template), &CancellationToken::new())
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.reason.unwrap().contains("not healthy"));
        assert!(commands.commands().is_empty());
        assert_eq!(backend.stopped(), vec!["db"]);
    }

    #[tokio::test]
    async fn test_sidecars_released_after_steps() {
        let backend = Arc::new(FakeBackend::healthy(&["redis"]));
        let sidecar_backend: Arc<dyn SidecarBackend> = backend.clone();
        let commands = Arc::new(
            ScriptedRunner::default().with("step-one", CommandOutput::exited(1, "", "")),
        );
        let command_runner: Arc<dyn CommandRunner> = commands.clone();

        let runner = StepRunner::new(
            command_runner,
            SidecarManager::new(Some(sidecar_backend), Duration::from_millis(10)),
            EngineSettings::default(),
        );
        let template = three_steps().with_sidecar(SidecarSpec::new("redis", "redis"));

        let result = runner
            .run(&instance(template), &CancellationToken::new())
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(backend.stopped(), vec!["redis"]);
        let requests = commands.requests.lock().unwrap();
        assert_eq!(requests[0].env["GANTRY_SERVICE_REDIS_HOST"], "127.0.0.1");
    }

    /// Blocks in its first command until the run is cancelled
    struct BlockingRunner;

    #[async_trait::async_trait]
    impl CommandRunner for BlockingRunner {
        async fn run(&self, _request: &CommandRequest, cancel: &CancellationToken) -> CommandOutput {
            cancel.cancelled().await;
            CommandOutput {
                cancelled: true,
                ..Default::default()
            }
        }
    }

    /// Sends its output line by line before returning it
    struct StreamingRunner;

    #[async_trait::async_trait]
    impl CommandRunner for StreamingRunner {
        async fn run(&self, request: &CommandRequest, _cancel: &CancellationToken) -> CommandOutput {
            if let Some(sink) = &request.output {
                for text in ["first", "second"] {
                    let _ = sink.send(OutputLine {
                        text: text.to_string(),
                        is_error: false,
                    });
                }
            }
            CommandOutput::exited(0, "first\nsecond", "")
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_step_stops_sidecars_once() {
        let backend = Arc::new(FakeBackend::healthy(&["svc"]));
        let sidecar_backend: Arc<dyn SidecarBackend> = backend.clone();

        let runner = StepRunner::new(
            Arc::new(BlockingRunner),
            SidecarManager::new(Some(sidecar_backend), Duration::from_millis(10)),
            EngineSettings::default(),
        );
        let template = three_steps().with_sidecar(SidecarSpec::new("svc", "redis"));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = runner.run(&instance(template), &cancel).await;

        assert_eq!(result.status, InstanceStatus::Skipped);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Skipped; 3]
        );
        assert_eq!(backend.stopped(), vec!["svc"]);
    }

    #[tokio::test]
    async fn test_output_lines_become_events() {
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let runner = StepRunner::new(
            Arc::new(StreamingRunner),
            SidecarManager::new(None, Duration::from_millis(10)),
            EngineSettings::default(),
        )
        .with_progress(tx);

        let result = runner
            .run(
                &instance(JobTemplate::new("build").with_step(StepDefinition::new("one", "x"))),
                &CancellationToken::new(),
            )
            .await;
        drop(runner);

        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StepOutput { output, .. } = event {
                lines.push(output);
            }
        }

        assert_eq!(result.steps[0].stdout, "first\nsecond");
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_captured_output_reported_when_not_streamed() {
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let commands = Arc::new(
            ScriptedRunner::default().with("x", CommandOutput::exited(0, "all at once", "")),
        );

        runner(&commands)
            .with_progress(tx)
            .run(
                &instance(JobTemplate::new("build").with_step(StepDefinition::new("one", "x"))),
                &CancellationToken::new(),
            )
            .await;

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::StepOutput { output, .. } = event {
                lines.push(output);
            }
        }
        assert_eq!(lines, vec!["all at once"]);
    }

    /// Reports which files the step sees in its working directory
    struct ListingRunner;

    #[async_trait::async_trait]
    impl CommandRunner for ListingRunner {
        async fn run(&self, request: &CommandRequest, _cancel: &CancellationToken) -> CommandOutput {
            let dir = &request.working_dir;
            let seen: Vec<&str> = ["app.py", "pkg/mod.py", ".git/HEAD"]
                .into_iter()
                .filter(|file| dir.join(file).exists())
                .collect();
            CommandOutput::exited(0, seen.join(" "), "")
        }
    }

    #[tokio::test]
    async fn test_checkout_copies_source_into_workspace() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("app.py"), "print(1)").unwrap();
        std::fs::create_dir_all(source.path().join("pkg")).unwrap();
        std::fs::write(source.path().join("pkg/mod.py"), "").unwrap();
        std::fs::create_dir_all(source.path().join(".git")).unwrap();
        std::fs::write(source.path().join(".git/HEAD"), "ref").unwrap();

        let runner = StepRunner::new(
            Arc::new(ListingRunner),
            SidecarManager::new(None, Duration::from_millis(10)),
            EngineSettings::default(),
        )
        .with_source_dir(source.path());

        let step = || StepDefinition::new("ls", "ls");
        let with_checkout = runner
            .run(
                &instance(JobTemplate::new("test").with_checkout(true).with_step(step())),
                &CancellationToken::new(),
            )
            .await;
        let without = runner
            .run(
                &instance(JobTemplate::new("lint").with_step(step())),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(with_checkout.steps[0].stdout, "app.py pkg/mod.py");
        assert_eq!(without.steps[0].stdout, "");
        assert!(source.path().join("app.py").exists());
    }

    #[tokio::test]
    async fn test_checkout_of_missing_source_fails_instance() {
        let commands = Arc::new(ScriptedRunner::default());

        let result = runner(&commands)
            .with_source_dir("/nonexistent/gantry/source")
            .run(
                &instance(three_steps().with_checkout(true)),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.reason.unwrap().starts_with("failed to check out source"));
        assert!(commands.commands().is_empty());
    }
}
