// Pipeline Executor
// Wires the graph, step runner, sidecars and scheduler into a single run

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{ExecutionGraph, ExecutionPlan, GraphError};
use crate::execution::runner::StepRunner;
use crate::execution::scheduler::JobScheduler;
use crate::execution::sidecar::SidecarManager;
use crate::pipeline::models::JobGraph;
use crate::report::{ResultAggregator, Verdict};
use crate::runners::container::{DockerBackend, SidecarBackend};
use crate::runners::shell::ShellRunner;
use crate::runners::CommandRunner;
use crate::settings::EngineSettings;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs a job graph end to end
pub struct PipelineExecutor {
    graph: ExecutionGraph,
    settings: EngineSettings,
    /// Progress event sender
    event_tx: Option<ProgressSender>,
    command_runner: Arc<dyn CommandRunner>,
    /// Located lazily when unset and the graph declares sidecars
    sidecar_backend: Option<Arc<dyn SidecarBackend>>,
}

impl PipelineExecutor {
    /// Expand and order the jobs of `graph`
    pub fn from_graph(graph: &JobGraph) -> Result<Self, GraphError> {
        Ok(Self::new(ExecutionGraph::build(graph)?))
    }

    pub fn new(graph: ExecutionGraph) -> Self {
        Self {
            graph,
            settings: EngineSettings::default(),
            event_tx: None,
            command_runner: Arc::new(ShellRunner::new()),
            sidecar_backend: None,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.command_runner = runner;
        self
    }

    pub fn with_sidecar_backend(mut self, backend: Arc<dyn SidecarBackend>) -> Self {
        self.sidecar_backend = Some(backend);
        self
    }

    /// Restrict the run to `jobs` and everything they need
    pub fn select_jobs(mut self, jobs: &[String]) -> Result<Self, GraphError> {
        if !jobs.is_empty() {
            self.graph = self.graph.select(jobs)?;
        }
        Ok(self)
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn plan(&self) -> ExecutionPlan {
        self.graph.plan()
    }

    /// Run every job to a terminal status and aggregate the verdict
    pub async fn execute(self, cancel: &CancellationToken) -> Verdict {
        let graph = Arc::new(self.graph);

        self.event_tx.send_event(ExecutionEvent::run_started(
            graph.name.clone(),
            graph.len(),
            graph.instance_count(),
        ));

        let backend = match self.sidecar_backend {
            Some(backend) => Some(backend),
            None if uses_sidecars(&graph) => locate_backend(&self.settings, &self.event_tx),
            None => None,
        };

        let mut sidecars = SidecarManager::new(backend, self.settings.health_check_interval());
        if let Some(tx) = &self.event_tx {
            sidecars = sidecars.with_progress(tx.clone());
        }

        let mut runner = StepRunner::new(self.command_runner, sidecars, self.settings.clone())
            .with_source_dir(graph.source_dir.clone())
            .with_env(graph.env.clone());
        if let Some(tx) = &self.event_tx {
            runner = runner.with_progress(tx.clone());
        }

        let mut scheduler = JobScheduler::new(graph.clone(), runner, self.settings.concurrency);
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_progress(tx.clone());
        }

        let outcome = scheduler.run(cancel).await;
        let verdict = ResultAggregator::aggregate(&graph, outcome);

        self.event_tx.send_event(ExecutionEvent::run_completed(
            verdict.run_name.clone(),
            verdict.passed(),
            verdict.cancelled,
            verdict.duration,
        ));

        verdict
    }
}

fn uses_sidecars(graph: &ExecutionGraph) -> bool {
    graph
        .nodes()
        .iter()
        .any(|node| !node.template.sidecars.is_empty())
}

/// A missing runtime only fails the instances that need sidecars
fn locate_backend(
    settings: &EngineSettings,
    events: &Option<ProgressSender>,
) -> Option<Arc<dyn SidecarBackend>> {
    match DockerBackend::locate(&settings.container_runtime) {
        Ok(backend) => Some(Arc::new(backend)),
        Err(e) => {
            tracing::warn!(error = %e, "container runtime unavailable");
            events.send_event(ExecutionEvent::warning(e.to_string(), None));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::execution::runner::tests::ScriptedRunner;
    use crate::execution::sidecar::tests::FakeBackend;
    use crate::pipeline::models::{
        InstanceStatus, JobStatus, JobTemplate, MatrixSpec, SidecarSpec, StepDefinition,
    };
    use crate::runners::CommandOutput;
    use std::time::Duration;

    fn settings() -> EngineSettings {
        EngineSettings {
            concurrency: 2,
            health_check_interval_ms: 5,
            ..EngineSettings::default()
        }
    }

    fn ci_graph() -> JobGraph {
        JobGraph::new("ci")
            .with_job(JobTemplate::new("lint").with_step(StepDefinition::new("flake8", "flake8 .")))
            .with_job(
                JobTemplate::new("test")
                    .with_needs(["lint"])
                    .with_step(StepDefinition::new("pytest", "pytest")),
            )
            .with_job(
                JobTemplate::new("deploy")
                    .with_needs(["test"])
                    .with_step(StepDefinition::new("ship", "./deploy.sh")),
            )
    }

    #[tokio::test]
    async fn test_lint_failure_skips_downstream() {
        let runner = ScriptedRunner::default().with("flake8 .", CommandOutput::exited(1, "", "E501"));
        let executor = PipelineExecutor::from_graph(&ci_graph())
            .unwrap()
            .with_settings(settings())
            .with_command_runner(Arc::new(runner));

        let verdict = executor.execute(&CancellationToken::new()).await;

        assert!(!verdict.passed());
        assert_eq!(verdict.exit_code(), 1);
        let statuses: Vec<JobStatus> = verdict.jobs.iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Failed, JobStatus::Skipped, JobStatus::Skipped]
        );
        assert_eq!(verdict.failures[0].step.as_deref(), Some("flake8"));
        assert_eq!(verdict.skipped[0].reason, "dependency 'lint' failed");
        assert_eq!(verdict.skipped[1].reason, "dependency 'test' was skipped");
    }

    #[tokio::test]
    async fn test_success_emits_run_events() {
        let (tx, mut rx) = progress_channel();
        let executor = PipelineExecutor::from_graph(&ci_graph())
            .unwrap()
            .with_settings(settings())
            .with_command_runner(Arc::new(ScriptedRunner::default()))
            .with_progress(tx);

        let verdict = executor.execute(&CancellationToken::new()).await;
        assert!(verdict.passed());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(ExecutionEvent::RunStarted { total_jobs: 3, total_instances: 3, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::RunCompleted { success: true, cancelled: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_select_jobs_pulls_in_dependencies() {
        let executor = PipelineExecutor::from_graph(&ci_graph())
            .unwrap()
            .select_jobs(&["test".to_string()])
            .unwrap();

        let plan = executor.plan();
        assert_eq!(plan.job_count(), 2);
        assert!(executor.graph().get("deploy").is_none());

        let missing = PipelineExecutor::from_graph(&ci_graph())
            .unwrap()
            .select_jobs(&["nope".to_string()]);
        assert!(matches!(missing, Err(GraphError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_matrix_job_with_sidecars() {
        let graph = JobGraph::new("ci").with_job(
            JobTemplate::new("test")
                .with_matrix(MatrixSpec::new().axis("python", ["3.11", "3.12"]))
                .with_sidecar(
                    SidecarSpec::new("db", "postgres")
                        .with_readiness_timeout(Duration::from_secs(5)),
                )
                .with_step(StepDefinition::new("pytest", "pytest")),
        );
        let backend = Arc::new(FakeBackend::healthy(&["db"]));

        let verdict = PipelineExecutor::from_graph(&graph)
            .unwrap()
            .with_settings(settings())
            .with_command_runner(Arc::new(ScriptedRunner::default()))
            .with_sidecar_backend(backend.clone())
            .execute(&CancellationToken::new())
            .await;

        assert!(verdict.passed());
        let instances: Vec<&str> = verdict.jobs[0]
            .instances
            .iter()
            .map(|i| i.instance_id.as_str())
            .collect();
        assert_eq!(instances, vec!["test (python=3.11)", "test (python=3.12)"]);
        assert!(verdict.jobs[0]
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Succeeded));
        assert_eq!(backend.stopped().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let verdict = PipelineExecutor::from_graph(&ci_graph())
            .unwrap()
            .with_command_runner(Arc::new(ScriptedRunner::default()))
            .execute(&cancel)
            .await;

        assert!(verdict.cancelled);
        assert_eq!(verdict.exit_code(), 130);
        assert!(verdict.jobs.iter().all(|j| j.status == JobStatus::Skipped));
    }
}
