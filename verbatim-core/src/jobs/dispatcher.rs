//! Bounded worker pool over the job registry.
//!
//! Workers are spawned lazily up to `max_instances` and exit when the
//! queue drains. Each worker owns one decoder (heavyweight, reused
//! across jobs). Jobs start in submission order; a job's own segments
//! are strictly ordered, but no ordering holds between jobs picked by
//! different workers.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::registry::{Job, JobRegistry};
use super::{JobId, JobRequest, JobStatus};
use crate::decode::{DecodeOutcome, DecoderFactory};
use crate::transcript::Segment;

/// Flags shared between a worker thread and the dispatcher.
#[derive(Default)]
struct WorkerShared {
    /// Local abort for the job this worker currently runs; combined
    /// with the job's own flag in the engine's abort query.
    abort: AtomicBool,
    current: Mutex<Option<JobId>>,
}

struct WorkerRecord {
    shared: Arc<WorkerShared>,
    handle: JoinHandle<()>,
}

struct DispatcherInner {
    registry: JobRegistry,
    queue: Mutex<VecDeque<JobId>>,
    /// Live worker count; incremented before spawn, decremented under
    /// the queue lock at the final empty pop so a pushed job is always
    /// observed by a live or freshly spawned worker.
    active: AtomicUsize,
    max_instances: usize,
    workers: Mutex<Vec<WorkerRecord>>,
    factory: Arc<dyn DecoderFactory>,
}

impl DispatcherInner {
    /// FIFO pop. Returns `None` after decrementing the active counter
    /// (both under the queue lock) when the queue is empty.
    fn next_job(&self) -> Option<JobId> {
        let mut queue = self.queue.lock();
        match queue.pop_front() {
            Some(id) => Some(id),
            None => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }
}

/// The job engine: submission, status, abort, and waiters.
pub struct JobDispatcher {
    inner: Arc<DispatcherInner>,
}

impl JobDispatcher {
    pub fn new(factory: Arc<dyn DecoderFactory>, max_instances: usize) -> Self {
        let max_instances = max_instances.max(1);
        info!(max_instances, "job dispatcher ready");
        Self {
            inner: Arc::new(DispatcherInner {
                registry: JobRegistry::new(),
                queue: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
                max_instances,
                workers: Mutex::new(Vec::new()),
                factory,
            }),
        }
    }

    /// Submit a job: register it as `Waiting`, queue it, and make sure
    /// a worker will pick it up.
    pub fn enqueue(&self, request: JobRequest) -> JobId {
        let job = self.inner.registry.insert(request);
        let id = job.id.clone();
        self.inner.queue.lock().push_back(id.clone());

        self.reap_workers();
        self.maybe_spawn_worker();

        debug!(job = %id, "job enqueued");
        id
    }

    /// O(1) status poll.
    pub fn status(&self, id: &str) -> Option<JobStatus> {
        Some(self.inner.registry.lookup(id)?.status())
    }

    /// Snapshot of the segments produced so far. Intended for terminal
    /// jobs; for running jobs the snapshot is a valid prefix.
    pub fn results(&self, id: &str) -> Option<Vec<Segment>> {
        let job = self.inner.registry.lookup(id)?;
        let state = job.state.lock();
        Some(state.segments.clone())
    }

    /// Request cancellation. A still-`Waiting` job is terminated here,
    /// without any decoder invocation; a `Running` job's worker is
    /// flagged so the acoustic layer stops at its next abort poll.
    ///
    /// Returns the status observed before the abort took effect.
    pub fn abort(&self, id: &str) -> Option<JobStatus> {
        let job = self.inner.registry.lookup(id)?;

        // Flag the owning worker first so the engine's poll trips even
        // if it is mid-decode.
        for worker in self.inner.workers.lock().iter() {
            if worker.shared.current.lock().as_deref() == Some(id) {
                debug!(job = %id, "flagging running worker for abort");
                worker.shared.abort.store(true, Ordering::Release);
            }
        }

        job.request_abort();

        let mut state = job.state.lock();
        let before = state.status;
        if before == JobStatus::Waiting {
            state.status = JobStatus::Aborted;
            drop(state);
            job.cond.notify_all();
            debug!(job = %id, "aborted while waiting");
        }
        Some(before)
    }

    /// Block until the job finishes, streaming newly produced segments
    /// through `on_segments(batch, new_count)`. Terminal delivery ends
    /// with a `new_count = 0` completion call. A `false` return from
    /// the callback stops waiting without affecting the job.
    pub fn wait<F>(&self, id: &str, mut on_segments: F) -> Option<JobStatus>
    where
        F: FnMut(&[Segment], usize) -> bool,
    {
        let job = self.inner.registry.lookup(id)?;
        let mut consumed = 0usize;

        loop {
            let (new_segments, status) = {
                let mut state = job.state.lock();
                while state.segments.len() == consumed && !state.status.is_terminal() {
                    job.cond.wait(&mut state);
                }
                (state.segments[consumed..].to_vec(), state.status)
            };

            // Deliver outside the job lock so a slow consumer never
            // blocks the worker's append path.
            if !new_segments.is_empty() {
                let n_new = new_segments.len();
                consumed += n_new;
                if !on_segments(&new_segments, n_new) {
                    return Some(status);
                }
            }

            if status.is_terminal() {
                on_segments(&[], 0);
                return Some(status);
            }
        }
    }

    /// Drop records of workers that have exited.
    fn reap_workers(&self) {
        self.inner
            .workers
            .lock()
            .retain(|worker| !worker.handle.is_finished());
    }

    /// Spawn a worker unless the pool is already at capacity. The
    /// active counter is claimed before the thread exists so two
    /// concurrent submitters cannot overshoot `max_instances`.
    fn maybe_spawn_worker(&self) {
        let claimed = self
            .inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.inner.max_instances).then_some(active + 1)
            })
            .is_ok();
        if !claimed {
            return;
        }

        let shared = Arc::new(WorkerShared::default());
        let inner = Arc::clone(&self.inner);
        let worker_shared = Arc::clone(&shared);

        let spawned = thread::Builder::new()
            .name("verbatim-worker".into())
            .spawn(move || worker_loop(inner, worker_shared));

        match spawned {
            Ok(handle) => {
                self.inner.workers.lock().push(WorkerRecord { shared, handle });
            }
            Err(e) => {
                error!("failed to spawn worker thread: {e}");
                self.inner.active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

fn worker_loop(inner: Arc<DispatcherInner>, shared: Arc<WorkerShared>) {
    debug!("worker started");
    let mut decoder = inner.factory.new_decoder();

    while let Some(id) = inner.next_job() {
        let Some(job) = inner.registry.lookup(&id) else {
            warn!(job = %id, "queued job missing from registry");
            continue;
        };

        if job.abort_requested() {
            job.finish(JobStatus::Aborted);
            debug!(job = %id, "aborted before decoding");
            continue;
        }

        shared.abort.store(false, Ordering::Release);
        *shared.current.lock() = Some(id.clone());

        if !job.start_running() {
            // Aborted between the flag check and the transition.
            *shared.current.lock() = None;
            continue;
        }

        let (status, decoder_poisoned) = run_job(&mut decoder, &job, &shared);

        // A panic leaves the decoder in an unknown state; rebuild it.
        if decoder_poisoned {
            decoder = inner.factory.new_decoder();
        }

        job.finish(status);
        *shared.current.lock() = None;
        debug!(job = %id, status = status.as_str(), "job finished");
    }

    debug!("worker exiting");
}

/// Decode one job, containing panics at the worker-loop boundary: the
/// current job is marked `Failed` and the worker survives. The second
/// return value reports whether the decoder must be rebuilt.
fn run_job(
    decoder: &mut crate::decode::Transcriber,
    job: &Arc<Job>,
    shared: &Arc<WorkerShared>,
) -> (JobStatus, bool) {
    let job_for_segments = Arc::clone(job);
    let worker = Arc::clone(shared);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut on_segments = |segments: Vec<Segment>| -> bool {
            job_for_segments.append_segments(segments);
            !worker.abort.load(Ordering::Acquire)
        };
        let should_abort =
            || shared.abort.load(Ordering::Acquire) || job.abort_requested();

        decoder.transcribe(
            &job.request.samples,
            &job.request.config,
            &mut on_segments,
            &should_abort,
        )
    }));

    match outcome {
        Ok(DecodeOutcome::Completed) => (JobStatus::Done, false),
        Ok(DecodeOutcome::Aborted) => (JobStatus::Aborted, false),
        Ok(DecodeOutcome::ModelError(detail)) => {
            error!(job = %job.id, %detail, "decoder error");
            (JobStatus::Failed, false)
        }
        Ok(DecodeOutcome::BadInput) => {
            warn!(job = %job.id, "job rejected: empty sample buffer");
            (JobStatus::Failed, false)
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(job = %job.id, %detail, "worker caught panic while decoding");
            (JobStatus::Failed, true)
        }
    }
}
