//! End-to-end tests of the job engine against instrumented engines:
//! lifecycle monotonicity, pool bounds, FIFO pickup, cancellation, and
//! the waiter prefix property.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use verbatim_core::decode::{
    DecodeHooks, EngineError, EngineParams, RawSegment, RawToken, SpeechEngine,
};
use verbatim_core::{
    DecodeConfig, DecoderFactory, JobDispatcher, JobRequest, JobStatus, Segment, Transcriber,
};

/// Samples per emitted segment; job duration scales with input length.
const SPAN: usize = 16_000;

#[derive(Default)]
struct Probe {
    running: AtomicUsize,
    max_running: AtomicUsize,
    starts: Mutex<Vec<usize>>,
}

/// Engine that emits one segment per `SPAN` samples with a fixed delay,
/// polling the abort query before each segment.
struct ProbeEngine {
    probe: Arc<Probe>,
    delay: Duration,
}

impl SpeechEngine for ProbeEngine {
    fn run(
        &mut self,
        samples: &[f32],
        _params: &EngineParams<'_>,
        hooks: &mut DecodeHooks<'_>,
    ) -> Result<(), EngineError> {
        self.probe.starts.lock().push(samples.len());
        let now = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_running.fetch_max(now, Ordering::SeqCst);

        let result = (|| {
            let count = samples.len().div_ceil(SPAN).max(1);
            for i in 0..count {
                if (hooks.should_abort)() {
                    return Err(EngineError::Aborted);
                }
                thread::sleep(self.delay);

                let t0 = i as i64 * 100;
                let text = format!("segment {i}");
                let segment = RawSegment {
                    t0,
                    t1: t0 + 100,
                    turn_next: false,
                    text: text.clone(),
                    lang: "en".into(),
                    tokens: vec![RawToken {
                        id: i as i32,
                        tid: 50364,
                        p: 0.9,
                        plog: -0.1,
                        pt: 0.9,
                        ptsum: 0.9,
                        t0,
                        t1: t0 + 100,
                        t_dtw: t0,
                        vlen: 1.0,
                        special: false,
                        text: text.into_bytes(),
                    }],
                };
                if !(hooks.on_segments)(vec![segment]) {
                    return Err(EngineError::Aborted);
                }
            }
            Ok(())
        })();

        self.probe.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn detected_language(&self) -> Option<String> {
        Some("en".into())
    }

    fn reset(&mut self) {}
}

struct ProbeFactory {
    probe: Arc<Probe>,
    delay: Duration,
}

impl DecoderFactory for ProbeFactory {
    fn new_decoder(&self) -> Transcriber {
        Transcriber::new(
            Box::new(ProbeEngine {
                probe: Arc::clone(&self.probe),
                delay: self.delay,
            }),
            None,
        )
    }
}

fn dispatcher(probe: &Arc<Probe>, delay_ms: u64, max_instances: usize) -> Arc<JobDispatcher> {
    Arc::new(JobDispatcher::new(
        Arc::new(ProbeFactory {
            probe: Arc::clone(probe),
            delay: Duration::from_millis(delay_ms),
        }),
        max_instances,
    ))
}

fn request(samples: usize) -> JobRequest {
    JobRequest::new(vec![0.0f32; samples], DecodeConfig::default())
}

fn wait_for_status(
    dispatcher: &JobDispatcher,
    id: &str,
    wanted: JobStatus,
    timeout: Duration,
) -> JobStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = dispatcher.status(id).expect("job exists");
        if status == wanted || Instant::now() >= deadline {
            return status;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn job_runs_to_done_and_streams_all_segments() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 5, 2);

    let id = dispatcher.enqueue(request(3 * SPAN));
    assert_eq!(id.len(), 6);

    let mut streamed: Vec<Segment> = Vec::new();
    let mut completion_calls = 0usize;
    let status = dispatcher
        .wait(&id, |batch, n_new| {
            if n_new == 0 {
                completion_calls += 1;
            } else {
                assert_eq!(batch.len(), n_new);
                streamed.extend_from_slice(batch);
            }
            true
        })
        .expect("job exists");

    assert_eq!(status, JobStatus::Done);
    assert_eq!(completion_calls, 1);
    assert_eq!(streamed.len(), 3);

    // The streamed sequence equals the final snapshot.
    let final_segments = dispatcher.results(&id).expect("job exists");
    assert_eq!(final_segments.len(), streamed.len());
    for (streamed, stored) in streamed.iter().zip(&final_segments) {
        assert_eq!(streamed.text, stored.text);
        assert_eq!(streamed.t0, stored.t0);
    }
}

#[test]
fn wait_on_unknown_id_is_none() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 1, 1);
    assert!(dispatcher.status("nosuch").is_none());
    assert!(dispatcher.wait("nosuch", |_, _| true).is_none());
    assert!(dispatcher.results("nosuch").is_none());
    assert!(dispatcher.abort("nosuch").is_none());
}

#[test]
fn two_waiters_observe_consistent_prefixes() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 10, 1);

    let id = dispatcher.enqueue(request(5 * SPAN));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let dispatcher = Arc::clone(&dispatcher);
        let id = id.clone();
        handles.push(thread::spawn(move || {
            let mut collected: Vec<String> = Vec::new();
            let status = dispatcher
                .wait(&id, |batch, n_new| {
                    assert_eq!(batch.len(), n_new);
                    collected.extend(batch.iter().map(|s| s.text.clone()));
                    true
                })
                .expect("job exists");
            (status, collected)
        }));
    }

    let final_texts: Vec<String> = {
        let results: Vec<(JobStatus, Vec<String>)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let reference = dispatcher
            .results(&id)
            .expect("job exists")
            .iter()
            .map(|s| s.text.clone())
            .collect::<Vec<_>>();
        for (status, collected) in results {
            assert_eq!(status, JobStatus::Done);
            assert_eq!(collected, reference, "waiter saw a non-prefix sequence");
        }
        reference
    };
    assert_eq!(final_texts.len(), 5);
}

#[test]
fn pool_never_exceeds_max_instances_and_starts_fifo() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 10, 2);

    // Distinct lengths identify jobs in the start log and stagger
    // completion times.
    let markers = [5 * SPAN, 8 * SPAN, 5 * SPAN + 1, 5 * SPAN + 2, 5 * SPAN + 3];
    let ids: Vec<String> = markers.iter().map(|&m| dispatcher.enqueue(request(m))).collect();

    for id in &ids {
        let status = wait_for_status(&dispatcher, id, JobStatus::Done, Duration::from_secs(10));
        assert_eq!(status, JobStatus::Done);
    }

    assert!(
        probe.max_running.load(Ordering::SeqCst) <= 2,
        "more than max_instances decoders ran concurrently"
    );

    let starts = probe.starts.lock();
    assert_eq!(starts.len(), 5);
    // The first two submissions start first (either order), the rest
    // are picked up strictly in submission order.
    let mut head = starts[..2].to_vec();
    head.sort_unstable();
    assert_eq!(head, vec![5 * SPAN, 8 * SPAN]);
    assert_eq!(&starts[2..], &markers[2..]);
}

#[test]
fn aborting_a_waiting_job_never_invokes_the_decoder() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 10, 1);

    // Occupy the single worker.
    let busy = dispatcher.enqueue(request(8 * SPAN));
    // Queue a second job and abort it while it waits.
    let victim = dispatcher.enqueue(request(3 * SPAN + 7));

    let before = dispatcher.abort(&victim).expect("job exists");
    assert_eq!(before, JobStatus::Waiting);
    assert_eq!(dispatcher.status(&victim), Some(JobStatus::Aborted));

    // A waiter on the aborted job returns immediately with no segments.
    let status = dispatcher
        .wait(&victim, |_batch, n_new| {
            assert_eq!(n_new, 0);
            true
        })
        .expect("job exists");
    assert_eq!(status, JobStatus::Aborted);

    wait_for_status(&dispatcher, &busy, JobStatus::Done, Duration::from_secs(10));
    assert!(
        !probe.starts.lock().contains(&(3 * SPAN + 7)),
        "aborted waiting job must never reach a decoder"
    );
}

#[test]
fn aborting_a_running_job_terminates_promptly_with_partial_results() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 20, 1);

    // 100 segments ≈ 2 s of decoding.
    let id = dispatcher.enqueue(request(100 * SPAN));
    let status = wait_for_status(&dispatcher, &id, JobStatus::Running, Duration::from_secs(2));
    assert_eq!(status, JobStatus::Running);

    // Let a few segments land first.
    thread::sleep(Duration::from_millis(90));

    let aborted_at = Instant::now();
    let before = dispatcher.abort(&id).expect("job exists");
    assert_eq!(before, JobStatus::Running);

    let status = wait_for_status(&dispatcher, &id, JobStatus::Aborted, Duration::from_millis(500));
    assert_eq!(status, JobStatus::Aborted);
    assert!(
        aborted_at.elapsed() < Duration::from_millis(500),
        "abort must take effect within one callback interval"
    );

    // Segments delivered before the abort remain readable.
    let partial = dispatcher.results(&id).expect("job exists");
    assert!(!partial.is_empty());
    assert!(partial.len() < 100);
}

#[test]
fn waiter_stop_does_not_affect_the_job() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 10, 1);

    let id = dispatcher.enqueue(request(4 * SPAN));

    let mut batches = 0usize;
    let status = dispatcher
        .wait(&id, |_batch, _n_new| {
            batches += 1;
            false // stop after the first delivery
        })
        .expect("job exists");
    assert_eq!(batches, 1);
    assert!(!status.is_terminal() || status == JobStatus::Done);

    // The job keeps decoding to completion regardless.
    let final_status = wait_for_status(&dispatcher, &id, JobStatus::Done, Duration::from_secs(5));
    assert_eq!(final_status, JobStatus::Done);
    assert_eq!(dispatcher.results(&id).expect("job exists").len(), 4);
}

#[test]
fn status_transitions_are_strictly_forward() {
    let probe = Arc::new(Probe::default());
    let dispatcher = dispatcher(&probe, 5, 1);

    let id = dispatcher.enqueue(request(3 * SPAN));

    // Sample the status until terminal; the observed sequence must be a
    // subsequence of Waiting → Running → Done.
    let mut observed = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = dispatcher.status(&id).expect("job exists");
        if observed.last() != Some(&status) {
            observed.push(status);
        }
        if status.is_terminal() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    let rank = |s: &JobStatus| match s {
        JobStatus::Waiting => 0,
        JobStatus::Running => 1,
        JobStatus::Done | JobStatus::Failed | JobStatus::Aborted => 2,
    };
    assert!(
        observed.windows(2).all(|w| rank(&w[0]) < rank(&w[1])),
        "non-monotonic status sequence: {observed:?}"
    );
    assert_eq!(observed.last(), Some(&JobStatus::Done));
}
