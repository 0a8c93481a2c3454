// Job Graph Scheduler
// Dependency-ordered, concurrency-bounded dispatch of job instances

use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::graph::{ExecutionGraph, JobNode};
use super::matrix::JobInstance;
use super::runner::StepRunner;
use super::status::StatusTable;
use crate::pipeline::models::{InstanceResult, InstanceStatus, JobResult, JobStatus, StepOutcome};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Results of one scheduler run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_name: String,
    /// Jobs in topological order, instances in matrix order
    pub jobs: Vec<JobResult>,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Per-job bookkeeping while a run is in progress
struct JobRun {
    results: Vec<Option<InstanceResult>>,
    remaining: usize,
    started: Option<Instant>,
    duration: Duration,
    /// Child of the run token; cancelled by fail-fast
    token: CancellationToken,
    skip_reason: Option<String>,
}

type Finished = (String, usize, InstanceResult);

/// Schedules the jobs of an execution graph
pub struct JobScheduler {
    graph: Arc<ExecutionGraph>,
    runner: Arc<StepRunner>,
    /// Maximum number of instances running at once
    concurrency: usize,
    event_tx: Option<ProgressSender>,
}

impl JobScheduler {
    pub fn new(graph: Arc<ExecutionGraph>, runner: StepRunner, concurrency: usize) -> Self {
        Self {
            graph,
            runner: Arc::new(runner),
            concurrency: concurrency.max(1),
            event_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run every job to a terminal status
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        let start = Instant::now();
        let table = StatusTable::new(self.graph.nodes().iter().map(|node| node.id().to_string()));
        let global = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Finished> = JoinSet::new();

        let mut runs: HashMap<String, JobRun> = self
            .graph
            .nodes()
            .iter()
            .map(|node| {
                let run = JobRun {
                    results: vec![None; node.instances.len()],
                    remaining: node.instances.len(),
                    started: None,
                    duration: Duration::ZERO,
                    token: cancel.child_token(),
                    skip_reason: None,
                };
                (node.id().to_string(), run)
            })
            .collect();

        tracing::info!(
            jobs = self.graph.len(),
            instances = self.graph.instance_count(),
            concurrency = self.concurrency,
            "starting run"
        );

        loop {
            self.resolve_pending(&table, &mut runs, &mut tasks, &global, cancel);

            match tasks.join_next().await {
                Some(Ok(finished)) => self.record(finished, &table, &mut runs),
                Some(Err(e)) => tracing::error!(error = %e, "instance task failed to complete"),
                None => break,
            }
        }

        self.sweep(&table, &mut runs);

        let jobs = self
            .graph
            .topological_order()
            .into_iter()
            .map(|node| self.job_result(node, &table, &mut runs))
            .collect();

        RunOutcome {
            run_name: self.graph.name.clone(),
            jobs,
            cancelled: cancel.is_cancelled(),
            duration: start.elapsed(),
        }
    }

    /// Promote Pending jobs whose dependencies are settled and dispatch Ready ones.
    ///
    /// A single pass in topological order settles transitive skips, since every
    /// dependency is visited before its dependents.
    fn resolve_pending(
        &self,
        table: &StatusTable,
        runs: &mut HashMap<String, JobRun>,
        tasks: &mut JoinSet<Finished>,
        global: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        for node in self.graph.topological_order() {
            let job = node.id();
            if table.get(job) != Some(JobStatus::Pending) {
                continue;
            }

            let mut blocked = None;
            let mut waiting = false;
            for dependency in &node.dependencies {
                match table.get(dependency) {
                    Some(JobStatus::Succeeded) => {}
                    Some(JobStatus::Failed) => {
                        blocked = Some(format!("dependency '{}' failed", dependency));
                        break;
                    }
                    Some(JobStatus::Skipped) => {
                        blocked = Some(format!("dependency '{}' was skipped", dependency));
                        break;
                    }
                    _ => waiting = true,
                }
            }

            if blocked.is_none() && cancel.is_cancelled() {
                blocked = Some("run cancelled".to_string());
            }

            if let Some(reason) = blocked {
                self.skip(node, reason, table, runs);
                continue;
            }
            if waiting {
                continue;
            }

            if let Err(e) = table.transition(job, JobStatus::Pending, JobStatus::Ready) {
                tracing::error!(job, error = %e, "status transition rejected");
                continue;
            }
            tracing::debug!(job, "job ready");
            self.event_tx.send_event(ExecutionEvent::JobReady {
                job_id: job.to_string(),
            });

            if let Err(e) = table.transition(job, JobStatus::Ready, JobStatus::Running) {
                tracing::error!(job, error = %e, "status transition rejected");
                continue;
            }

            if let Some(run) = runs.get_mut(job) {
                run.started = Some(Instant::now());
                self.dispatch(node, run, tasks, global);
            }
        }
    }

    fn skip(
        &self,
        node: &JobNode,
        reason: String,
        table: &StatusTable,
        runs: &mut HashMap<String, JobRun>,
    ) {
        let job = node.id();
        if let Err(e) = table.transition(job, JobStatus::Pending, JobStatus::Skipped) {
            tracing::error!(job, error = %e, "status transition rejected");
            return;
        }

        tracing::info!(job, reason = %reason, "job skipped");
        self.event_tx
            .send_event(ExecutionEvent::job_skipped(job, reason.clone()));

        if let Some(run) = runs.get_mut(job) {
            run.results = node
                .instances
                .iter()
                .map(|instance| Some(skipped_instance(instance, &reason)))
                .collect();
            run.remaining = 0;
            run.skip_reason = Some(reason);
        }
    }

    /// Spawn one task per instance; permits are taken inside the task
    fn dispatch(
        &self,
        node: &JobNode,
        run: &JobRun,
        tasks: &mut JoinSet<Finished>,
        global: &Arc<Semaphore>,
    ) {
        let job_limit = node
            .template
            .max_parallel
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        for (index, instance) in node.instances.iter().enumerate() {
            let instance = instance.clone();
            let runner = Arc::clone(&self.runner);
            let token = run.token.clone();
            let global = Arc::clone(global);
            let job_limit = job_limit.clone();

            tasks.spawn(async move {
                let _permits = tokio::select! {
                    permits = acquire_permits(job_limit, global) => Some(permits),
                    _ = token.cancelled() => None,
                };

                let job_id = instance.job_id().to_string();
                let instance_id = instance.id.clone();
                let selection = instance.selection.clone();

                // Inner task so a panic fails this instance instead of the run
                let inner = tokio::spawn(async move { runner.run(&instance, &token).await });
                let result = match inner.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(instance = %instance_id, error = %e, "instance task panicked");
                        let mut result = InstanceResult::pending(instance_id, &job_id, selection);
                        result.transition(InstanceStatus::Failed);
                        result.reason = Some(format!("instance task panicked: {}", e));
                        result
                    }
                };

                (job_id, index, result)
            });
        }
    }

    fn record(&self, finished: Finished, table: &StatusTable, runs: &mut HashMap<String, JobRun>) {
        let (job, index, result) = finished;
        let Some(node) = self.graph.get(&job) else {
            return;
        };
        let Some(run) = runs.get_mut(&job) else {
            return;
        };

        if result.status == InstanceStatus::Failed
            && node.template.fail_fast
            && !run.token.is_cancelled()
        {
            tracing::info!(job = %job, instance = %result.instance_id, "fail-fast: cancelling remaining instances");
            run.token.cancel();
        }

        if run.results[index].replace(result).is_none() {
            run.remaining = run.remaining.saturating_sub(1);
        }

        if run.remaining == 0 {
            self.complete(&job, run, table);
        }
    }

    fn complete(&self, job: &str, run: &mut JobRun, table: &StatusTable) {
        let instances: Vec<InstanceResult> = run.results.iter().flatten().cloned().collect();
        let status = JobResult::status_from_instances(&instances);
        run.duration = run.started.map(|s| s.elapsed()).unwrap_or_default();

        if let Err(e) = table.transition(job, JobStatus::Running, status) {
            tracing::error!(job, error = %e, "status transition rejected");
            return;
        }

        tracing::info!(job, status = ?status, duration = ?run.duration, "job finished");
        self.event_tx
            .send_event(ExecutionEvent::job_completed(job, status, run.duration));
    }

    /// Settle anything left non-terminal (lost tasks); never expected on a clean run
    fn sweep(&self, table: &StatusTable, runs: &mut HashMap<String, JobRun>) {
        for node in self.graph.topological_order() {
            let job = node.id();
            let Some(run) = runs.get_mut(job) else {
                continue;
            };

            match table.get(job) {
                Some(JobStatus::Running) => {
                    for (slot, instance) in run.results.iter_mut().zip(&node.instances) {
                        if slot.is_none() {
                            let mut result = InstanceResult::pending(
                                &instance.id,
                                instance.job_id(),
                                instance.selection.clone(),
                            );
                            result.transition(InstanceStatus::Failed);
                            result.reason = Some("instance did not report a result".to_string());
                            *slot = Some(result);
                        }
                    }
                    run.remaining = 0;
                    tracing::warn!(job, "job still running after all tasks finished");
                    self.complete(job, run, table);
                }
                Some(JobStatus::Pending) => {
                    let reason = "not scheduled".to_string();
                    self.skip(node, reason, table, runs);
                }
                _ => {}
            }
        }
    }

    fn job_result(
        &self,
        node: &JobNode,
        table: &StatusTable,
        runs: &mut HashMap<String, JobRun>,
    ) -> JobResult {
        let job = node.id();
        let run = runs.remove(job);
        let status = table.get(job).unwrap_or(JobStatus::Skipped);

        let (instances, skip_reason, duration) = match run {
            Some(run) => (
                run.results.into_iter().flatten().collect(),
                run.skip_reason,
                run.duration,
            ),
            None => (Vec::new(), None, Duration::ZERO),
        };

        JobResult {
            job_id: job.to_string(),
            status,
            instances,
            skip_reason,
            duration,
        }
    }
}

async fn acquire_permits(
    job_limit: Option<Arc<Semaphore>>,
    global: Arc<Semaphore>,
) -> (Option<OwnedSemaphorePermit>, Option<OwnedSemaphorePermit>) {
    // Job permit first so a throttled job does not hold global slots
    let job_permit = match job_limit {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    };
    let global_permit = global.acquire_owned().await.ok();
    (job_permit, global_permit)
}

fn skipped_instance(instance: &JobInstance, reason: &str) -> InstanceResult {
    let mut result =
        InstanceResult::pending(&instance.id, instance.job_id(), instance.selection.clone());
    result.steps = instance
        .steps
        .iter()
        .map(|step| StepOutcome::skipped(&step.name, reason))
        .collect();
    result.reason = Some(reason.to_string());
    result.transition(InstanceStatus::Skipped);
    result
}
