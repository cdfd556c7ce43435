//! Job registry: id → job mapping plus the per-job synchronization.
//!
//! Two-tier locking: a registry-wide `RwLock` guards only the id map
//! (never held while blocking); each job carries its own mutex +
//! condition variable for its mutable fields. The `Arc` strong count on
//! a job entry is the borrower count of the sync handles — waiters and
//! the worker hold scoped clones, and the last holder frees them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::{JobId, JobRequest, JobStatus};
use crate::transcript::Segment;

/// Length of generated job ids.
const JOB_ID_LEN: usize = 6;

/// Mutable job fields, guarded by the job's own lock.
#[derive(Debug)]
pub struct JobState {
    pub status: JobStatus,
    /// Append-only while `Running`; the worker is the sole writer.
    pub segments: Vec<Segment>,
}

/// One registered job: immutable request + guarded mutable state.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    pub(crate) state: Mutex<JobState>,
    pub(crate) cond: Condvar,
    abort: AtomicBool,
}

impl Job {
    fn new(id: JobId, request: JobRequest) -> Self {
        Self {
            id,
            request,
            state: Mutex::new(JobState {
                status: JobStatus::Waiting,
                segments: Vec::new(),
            }),
            cond: Condvar::new(),
            abort: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    /// Write-once abort flag; does not by itself change status.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Transition `Waiting → Running`. Returns `false` (and leaves the
    /// job untouched) if it was already terminal — e.g. aborted while
    /// still queued.
    pub(crate) fn start_running(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != JobStatus::Waiting {
                return false;
            }
            state.status = JobStatus::Running;
        }
        self.cond.notify_all();
        true
    }

    /// Append newly produced segments and wake all waiters.
    pub(crate) fn append_segments(&self, segments: Vec<Segment>) {
        if segments.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.segments.extend(segments);
        }
        self.cond.notify_all();
    }

    /// Terminal transition; no-op when already terminal.
    pub(crate) fn finish(&self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
        }
        self.cond.notify_all();
    }
}

/// Maps job ids to jobs. Insert-only; terminal jobs stay readable for
/// the process lifetime.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under a fresh random id (regenerated on the
    /// unlikely collision).
    pub fn insert(&self, request: JobRequest) -> Arc<Job> {
        let mut jobs = self.jobs.write();
        let mut id = new_job_id();
        while jobs.contains_key(&id) {
            id = new_job_id();
        }
        let job = Arc::new(Job::new(id.clone(), request));
        jobs.insert(id, Arc::clone(&job));
        job
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

/// 6 characters from the 62-symbol alphanumeric charset, drawn from the
/// thread-local OS-seeded generator.
fn new_job_id() -> JobId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_LEN)
        .map(char::from)
        .collect()
}
