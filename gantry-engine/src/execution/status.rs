// Job status table
// The only shared mutable scheduler state; every transition is a validated compare-and-set

use crate::pipeline::models::JobStatus;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job '{job}' is {actual:?}, expected {expected:?}")]
    Conflict {
        job: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("illegal transition {from:?} -> {to:?} for job '{job}'")]
    Illegal {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Shared job status table
#[derive(Debug, Clone, Default)]
pub struct StatusTable {
    inner: Arc<Mutex<HashMap<String, JobStatus>>>,
}

impl StatusTable {
    /// All jobs start Pending
    pub fn new<I, S>(jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses = jobs
            .into_iter()
            .map(|job| (job.into(), JobStatus::Pending))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(statuses)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobStatus>> {
        // A poisoned table still holds valid statuses
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically move `job` from `from` to `to`
    pub fn transition(&self, job: &str, from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if !from.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                job: job.to_string(),
                from,
                to,
            });
        }

        let mut statuses = self.lock();
        let current = statuses
            .get_mut(job)
            .ok_or_else(|| TransitionError::UnknownJob(job.to_string()))?;

        if *current != from {
            return Err(TransitionError::Conflict {
                job: job.to_string(),
                expected: from,
                actual: *current,
            });
        }

        *current = to;
        tracing::trace!(job, from = ?from, to = ?to, "job status changed");
        Ok(())
    }

    pub fn get(&self, job: &str) -> Option<JobStatus> {
        self.lock().get(job).copied()
    }
}
