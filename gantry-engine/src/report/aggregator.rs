// Result Aggregator
// Folds per-job results into a single verdict with actionable failure details

use crate::error::{EngineError, EngineResult};
use crate::execution::graph::ExecutionGraph;
use crate::execution::scheduler::RunOutcome;
use crate::pipeline::models::{serialize_duration, InstanceStatus, JobResult, JobStatus};

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Overall result of a run
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub run_name: String,
    pub outcome: Outcome,
    pub cancelled: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    /// Jobs in topological order (declaration order tie-break)
    pub jobs: Vec<JobResult>,
    pub failures: Vec<FailureDetail>,
    pub skipped: Vec<SkipDetail>,
}

/// One failing instance (and step, when a step caused it)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub job_id: String,
    pub instance_id: String,
    pub step: Option<String>,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkipDetail {
    pub job_id: String,
    pub reason: String,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    /// 0 on pass, 130 when cancelled, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        self.ensure_pass().map_or_else(|e| e.exit_code(), |()| 0)
    }

    /// Turn a failed verdict into an error
    pub fn ensure_pass(&self) -> EngineResult<()> {
        if self.passed() {
            return Ok(());
        }
        if self.cancelled {
            return Err(EngineError::Cancelled);
        }

        let failed: Vec<&str> = self
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| job.job_id.as_str())
            .collect();
        Err(EngineError::StepFailure {
            failed: failed.len(),
            summary: failed.join(", "),
        })
    }
}

/// Builds verdicts from scheduler output
pub struct ResultAggregator;

impl ResultAggregator {
    /// Pass iff every scheduled job Succeeded
    pub fn aggregate(graph: &ExecutionGraph, outcome: RunOutcome) -> Verdict {
        let RunOutcome {
            run_name,
            jobs: mut results,
            cancelled,
            duration,
        } = outcome;

        let mut jobs = Vec::with_capacity(graph.len());
        for node in graph.topological_order() {
            let job = match results.iter().position(|r| r.job_id == node.id()) {
                Some(index) => results.swap_remove(index),
                None => JobResult {
                    job_id: node.id().to_string(),
                    status: JobStatus::Skipped,
                    instances: Vec::new(),
                    skip_reason: Some("not scheduled".to_string()),
                    duration: Duration::ZERO,
                },
            };
            jobs.push(job);
        }

        let mut failures = Vec::new();
        let mut skipped = Vec::new();

        for job in &jobs {
            match job.status {
                JobStatus::Failed => failures.extend(Self::failures_of(job)),
                JobStatus::Skipped => skipped.push(SkipDetail {
                    job_id: job.job_id.clone(),
                    reason: job
                        .skip_reason
                        .clone()
                        .unwrap_or_else(|| "cancelled".to_string()),
                }),
                _ => {}
            }
        }

        let outcome = if !jobs.is_empty() && jobs.iter().all(|j| j.status == JobStatus::Succeeded) {
            Outcome::Pass
        } else {
            Outcome::Fail
        };

        tracing::info!(
            outcome = ?outcome,
            failed = failures.len(),
            skipped = skipped.len(),
            "run aggregated"
        );

        Verdict {
            run_name,
            outcome,
            cancelled,
            duration,
            jobs,
            failures,
            skipped,
        }
    }

    fn failures_of(job: &JobResult) -> Vec<FailureDetail> {
        let mut failures = Vec::new();

        for instance in job
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Failed)
        {
            let mut steps = instance.failed_steps().peekable();
            if steps.peek().is_none() {
                failures.push(FailureDetail {
                    job_id: job.job_id.clone(),
                    instance_id: instance.instance_id.clone(),
                    step: None,
                    reason: instance
                        .reason
                        .clone()
                        .unwrap_or_else(|| "instance failed".to_string()),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                });
                continue;
            }

            for step in steps {
                failures.push(FailureDetail {
                    job_id: job.job_id.clone(),
                    instance_id: instance.instance_id.clone(),
                    step: Some(step.name.clone()),
                    reason: step.failure_reason(),
                    exit_code: step.exit_code,
                    stdout: step.stdout.clone(),
                    stderr: step.stderr.clone(),
                });
            }
        }

        failures
    }
}
