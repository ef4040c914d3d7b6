//! Registry of currently executing runs.
//!
//! One entry per live run, keyed by job id. The registry is an owned object
//! held by the service; its size is the number of runs executing right now.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::domain::JobId;
use crate::error::{Result, RunError};

/// Registry record of a live run.
///
/// The child process is owned by the run's supervisor task; the handle
/// carries the identity of the run and the signal that asks the supervisor
/// to kill it.
#[derive(Debug)]
pub struct RunHandle {
    pub job_id: JobId,
    pub script_path: PathBuf,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    kill: Option<oneshot::Sender<()>>,
}

impl RunHandle {
    pub fn new(
        job_id: JobId,
        script_path: PathBuf,
        pid: Option<u32>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            job_id,
            script_path,
            pid,
            started_at: Utc::now(),
            kill: Some(kill),
        }
    }

    /// Ask the supervisor to kill the process. Returns `false` if the
    /// signal was already sent or the supervisor is gone.
    fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Read-only view of a running job, as served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJob {
    pub test_id: JobId,
    pub script_path: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Mutex-guarded map of job id to live run.
///
/// The lock is only held for single map operations, never across an await.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<JobId, RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<JobId, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a launched run. A job id can only be live once.
    pub fn register(&self, handle: RunHandle) -> Result<()> {
        let mut runs = self.runs();
        if runs.contains_key(&handle.job_id) {
            return Err(RunError::DuplicateJob(handle.job_id.to_string()));
        }
        runs.insert(handle.job_id.clone(), handle);
        Ok(())
    }

    /// Stop tracking a run. Removing an absent id is a no-op.
    pub fn unregister(&self, job_id: &JobId) -> Option<RunHandle> {
        self.runs().remove(job_id)
    }

    pub fn size(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.runs().contains_key(job_id)
    }

    /// Running jobs ordered by start time.
    pub fn snapshot(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<RunningJob> = self
            .runs()
            .values()
            .map(|handle| RunningJob {
                test_id: handle.job_id.clone(),
                script_path: handle.script_path.display().to_string(),
                pid: handle.pid,
                started_at: handle.started_at,
            })
            .collect();
        jobs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.test_id.cmp(&b.test_id))
        });
        jobs
    }

    /// Signal the supervisor of a live run to kill its process. The entry
    /// stays registered until the supervisor observes the exit.
    pub fn terminate(&self, job_id: &JobId) -> bool {
        self.runs()
            .get_mut(job_id)
            .map(RunHandle::kill)
            .unwrap_or(false)
    }
}
