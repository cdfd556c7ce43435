//! Per-worker decode driver.
//!
//! `Transcriber` owns one `SpeechEngine` plus an optional VAD
//! segmenter, and runs a single job either over the whole buffer or
//! per detected speech range. Raw backend segments are stitched and
//! offset-rebased before they reach the caller.

use std::cell::Cell;

use tracing::{debug, trace, warn};

use super::stitch::stitch_tokens;
use super::{DecodeConfig, DecodeHooks, EngineError, EngineParams, RawSegment, SpeechEngine};
use crate::transcript::Segment;
use crate::vad::VadSegmenter;

/// Distinguished result kinds of one driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Completed,
    Aborted,
    ModelError(String),
    BadInput,
}

/// Builds one decoder per worker from process-wide shared model
/// resources. The decoder is heavyweight and reused across jobs.
pub trait DecoderFactory: Send + Sync + 'static {
    fn new_decoder(&self) -> Transcriber;
}

pub struct Transcriber {
    engine: Box<dyn SpeechEngine>,
    segmenter: Option<VadSegmenter>,
}

impl Transcriber {
    pub fn new(engine: Box<dyn SpeechEngine>, segmenter: Option<VadSegmenter>) -> Self {
        Self { engine, segmenter }
    }

    /// Run the acoustic model over `samples` and deliver rebased,
    /// stitched segments through `on_segments`. `external_abort` is
    /// polled by the acoustic layer; combined with the driver's own
    /// stop flag (set when `on_segments` returns `false`).
    pub fn transcribe(
        &mut self,
        samples: &[f32],
        config: &DecodeConfig,
        on_segments: &mut dyn FnMut(Vec<Segment>) -> bool,
        external_abort: &dyn Fn() -> bool,
    ) -> DecodeOutcome {
        if samples.is_empty() {
            return DecodeOutcome::BadInput;
        }

        if config.reset_context {
            self.engine.reset();
        }

        let stop = Cell::new(false);
        let should_abort = || stop.get() || external_abort();

        let use_vad = config.use_vad && self.segmenter.is_some();
        debug!(
            samples = samples.len(),
            use_vad,
            lang = %config.lang,
            "decode start"
        );

        // Split borrows: the range iterator holds the segmenter while
        // the engine runs per range.
        let engine = &mut self.engine;

        if use_vad {
            let segmenter = self.segmenter.as_mut().expect("checked above");
            segmenter.reconfigure(&config.vad);
            let sample_rate = config.vad.sample_rate.max(1) as u64;
            let mut committed_lang: Option<String> = config.lang_hint().map(str::to_owned);
            let mut prev_end = 0usize;

            for range in segmenter.segment(samples) {
                if range.is_empty() {
                    continue;
                }

                if should_abort() {
                    return DecodeOutcome::Aborted;
                }

                // The job-level reset already happened before the loop;
                // inside it a reset is purely gap-triggered and applies
                // to this range only.
                let gap_ms = (range.start - prev_end) as u64 * 1000 / sample_rate;
                let no_context = prev_end > 0 && gap_ms >= config.reset_min_nospeech_ms as u64;
                let offset_ms = range.start as u64 * 1000 / sample_rate;
                let offset_t = (offset_ms / 10) as i64;

                trace!(
                    start = range.start,
                    end = range.end,
                    gap_ms,
                    no_context,
                    "decoding VAD range"
                );

                let params = EngineParams {
                    lang: committed_lang.as_deref(),
                    translate: config.translate,
                    no_context,
                    n_threads: config.n_threads,
                    offset_ms: 0,
                    duration_ms: 0,
                };

                let outcome = run_once(
                    engine.as_mut(),
                    &samples[range.start..range.end],
                    &params,
                    offset_t,
                    on_segments,
                    &stop,
                    &should_abort,
                );
                if let Some(outcome) = outcome {
                    return outcome;
                }

                // Do not re-detect: reuse the committed language for the
                // remaining ranges.
                if committed_lang.is_none() {
                    committed_lang = engine.detected_language();
                }

                prev_end = range.end;
            }
        } else {
            if config.use_vad {
                warn!("VAD requested but no segmenter is available; decoding whole buffer");
            }
            let params = EngineParams {
                lang: config.lang_hint(),
                translate: config.translate,
                no_context: config.reset_context,
                n_threads: config.n_threads,
                offset_ms: config.offset_ms,
                duration_ms: config.duration_ms,
            };

            let outcome = run_once(
                engine.as_mut(),
                samples,
                &params,
                0,
                on_segments,
                &stop,
                &should_abort,
            );
            if let Some(outcome) = outcome {
                return outcome;
            }
        }

        if stop.get() {
            DecodeOutcome::Aborted
        } else {
            DecodeOutcome::Completed
        }
    }

    /// Language committed by the most recent decode, if any.
    pub fn detected_language(&self) -> Option<String> {
        self.engine.detected_language()
    }
}

/// One engine run; returns `Some(outcome)` to end the job early.
fn run_once(
    engine: &mut dyn SpeechEngine,
    slice: &[f32],
    params: &EngineParams<'_>,
    offset_t: i64,
    on_segments: &mut dyn FnMut(Vec<Segment>) -> bool,
    stop: &Cell<bool>,
    should_abort: &dyn Fn() -> bool,
) -> Option<DecodeOutcome> {
    let mut forward = |batch: Vec<RawSegment>| -> bool {
        let segments: Vec<Segment> = batch
            .into_iter()
            .map(|raw| finalize_segment(raw, offset_t))
            .collect();
        trace!(new = segments.len(), "new segments from engine");
        let keep_going = on_segments(segments);
        if !keep_going {
            trace!("abort requested by segment callback");
            stop.set(true);
        }
        keep_going
    };

    let mut hooks = DecodeHooks {
        on_segments: &mut forward,
        should_abort,
    };

    match engine.run(slice, params, &mut hooks) {
        Ok(()) => None,
        Err(EngineError::Aborted) => Some(DecodeOutcome::Aborted),
        Err(EngineError::Model(detail)) => {
            // Reset so the worker can take the next job on a clean state.
            engine.reset();
            Some(DecodeOutcome::ModelError(detail))
        }
    }
}

/// Stitch tokens and rebase timestamps by the range offset.
fn finalize_segment(raw: RawSegment, offset_t: i64) -> Segment {
    let mut tokens = stitch_tokens(raw.tokens);
    if offset_t > 0 {
        for token in &mut tokens {
            token.t0 += offset_t;
            token.t1 += offset_t;
            token.t_dtw += offset_t;
        }
    }
    Segment {
        t0: raw.t0 + offset_t,
        t1: raw.t1 + offset_t,
        text: raw.text,
        turn_next: raw.turn_next,
        tokens,
        lang: raw.lang,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{RawToken, StubEngine};
    use crate::vad::{VadBackend, VadConfig};
    use crate::error::Result as CoreResult;

    use std::sync::Arc;

    use parking_lot::Mutex;

    /// What the scripted engine saw on each run.
    #[derive(Debug, Clone, PartialEq)]
    struct RunRecord {
        no_context: bool,
        lang: Option<String>,
    }

    /// Engine that replays a scripted list of per-run segment batches
    /// and records the params it was handed.
    struct ScriptedEngine {
        runs: Vec<Vec<RawSegment>>,
        next: usize,
        records: Arc<Mutex<Vec<RunRecord>>>,
    }

    impl ScriptedEngine {
        fn new(runs: Vec<Vec<RawSegment>>) -> (Self, Arc<Mutex<Vec<RunRecord>>>) {
            let records = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    runs,
                    next: 0,
                    records: Arc::clone(&records),
                },
                records,
            )
        }
    }

    impl SpeechEngine for ScriptedEngine {
        fn run(
            &mut self,
            _samples: &[f32],
            params: &EngineParams<'_>,
            hooks: &mut DecodeHooks<'_>,
        ) -> std::result::Result<(), EngineError> {
            self.records.lock().push(RunRecord {
                no_context: params.no_context,
                lang: params.lang.map(str::to_owned),
            });

            let batch = self.runs.get(self.next).cloned().unwrap_or_default();
            self.next += 1;
            if !batch.is_empty() && !(hooks.on_segments)(batch) {
                return Err(EngineError::Aborted);
            }
            Ok(())
        }

        fn detected_language(&self) -> Option<String> {
            Some("lv".into())
        }

        fn reset(&mut self) {}
    }

    struct ScriptedVad {
        probs: Vec<f32>,
        idx: usize,
    }

    impl VadBackend for ScriptedVad {
        fn predict(&mut self, _window: &[f32]) -> CoreResult<f32> {
            let p = self.probs.get(self.idx).copied().unwrap_or(0.0);
            self.idx += 1;
            Ok(p)
        }

        fn reset(&mut self) {
            self.idx = 0;
        }
    }

    fn raw_segment(t0: i64, t1: i64, text: &str) -> RawSegment {
        RawSegment {
            t0,
            t1,
            turn_next: false,
            text: text.into(),
            lang: "lv".into(),
            tokens: vec![RawToken {
                id: 0,
                tid: 50364,
                p: 0.9,
                plog: -0.1,
                pt: 0.9,
                ptsum: 0.9,
                t0,
                t1,
                t_dtw: t0,
                vlen: 1.0,
                special: false,
                text: text.as_bytes().to_vec(),
            }],
        }
    }

    fn vad_config() -> VadConfig {
        VadConfig {
            sample_rate: 16_000,
            window_ms: 64,
            threshold: 0.5,
            min_silence_ms: 128,
            speech_pad_ms: 0,
            min_speech_ms: 64,
            max_speech_s: f32::INFINITY,
        }
    }

    #[test]
    fn empty_input_is_bad_input() {
        let mut transcriber = Transcriber::new(Box::new(StubEngine::new()), None);
        let outcome = transcriber.transcribe(
            &[],
            &DecodeConfig::default(),
            &mut |_| true,
            &|| false,
        );
        assert_eq!(outcome, DecodeOutcome::BadInput);
    }

    #[test]
    fn whole_buffer_mode_applies_no_offset() {
        let (engine, _records) = ScriptedEngine::new(vec![vec![raw_segment(0, 100, "hello")]]);
        let mut transcriber = Transcriber::new(Box::new(engine), None);

        let mut collected = Vec::new();
        let outcome = transcriber.transcribe(
            &vec![0.0; 16_000],
            &DecodeConfig::default(),
            &mut |segments| {
                collected.extend(segments);
                true
            },
            &|| false,
        );

        assert_eq!(outcome, DecodeOutcome::Completed);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].t0, 0);
        assert_eq!(collected[0].tokens[0].t0, 0);
    }

    #[test]
    fn vad_mode_rebases_timestamps_by_range_offset() {
        const W: usize = 1024;
        // Second range starts after 5 windows of silence.
        let probs = vec![
            0.9, 0.9, 0.1, 0.1, 0.1, // range 1: [0, 3W)
            0.9, 0.9, 0.1, 0.1, 0.1, // range 2: [5W, 8W)
        ];
        let n = probs.len();
        let vad = VadSegmenter::new(
            Box::new(ScriptedVad { probs, idx: 0 }),
            &vad_config(),
        );
        let (engine, records) = ScriptedEngine::new(vec![
            vec![raw_segment(0, 19, "one")],
            vec![raw_segment(0, 19, "two")],
        ]);
        let mut transcriber = Transcriber::new(Box::new(engine), Some(vad));

        let mut config = DecodeConfig::default();
        config.use_vad = true;
        config.vad = vad_config();

        let mut collected = Vec::new();
        let outcome = transcriber.transcribe(
            &vec![0.0f32; n * W],
            &config,
            &mut |segments| {
                collected.extend(segments);
                true
            },
            &|| false,
        );

        assert_eq!(outcome, DecodeOutcome::Completed);
        assert_eq!(collected.len(), 2);

        // Range 1 starts at sample 0 → no offset.
        assert_eq!(collected[0].t0, 0);

        // Range 2 starts at 5 * 1024 samples = 320 ms → 32 ticks.
        let offset_t = (5 * W as u64 * 1000 / 16_000 / 10) as i64;
        assert_eq!(collected[1].t0, offset_t);
        assert_eq!(collected[1].t1, 19 + offset_t);
        assert_eq!(collected[1].tokens[0].t_dtw, offset_t);

        // Segments non-decreasing in t0, tokens non-negative.
        assert!(collected[0].t0 <= collected[1].t0);
        assert!(collected.iter().all(|s| s.tokens.iter().all(|t| t.t0 >= 0)));

        // First range detects ("auto" → None), second reuses the
        // committed language.
        let records = records.lock();
        assert_eq!(records[0].lang, None);
        assert_eq!(records[1].lang.as_deref(), Some("lv"));
    }

    #[test]
    fn long_gap_forces_context_reset_for_that_range_only() {
        const W: usize = 1024;
        // Three ranges; the gap before the third exceeds the reset
        // threshold (set low for the test).
        let probs = vec![
            0.9, 0.1, 0.1, 0.1, // range 1 closes at 2W
            0.9, 0.1, 0.1, 0.1, // range 2
            0.1, 0.1, 0.1, 0.1, // long silence
            0.9, 0.1, 0.1, 0.1, // range 3
        ];
        let n = probs.len();
        let vad = VadSegmenter::new(
            Box::new(ScriptedVad { probs, idx: 0 }),
            &vad_config(),
        );
        let (engine, records) = ScriptedEngine::new(vec![vec![], vec![], vec![]]);
        let mut transcriber = Transcriber::new(Box::new(engine), Some(vad));

        let mut config = DecodeConfig::default();
        config.use_vad = true;
        config.vad = vad_config();
        // The gap before the third range is ~384 ms; reset after 200 ms
        // of non-speech.
        config.reset_min_nospeech_ms = 200;

        let outcome = transcriber.transcribe(
            &vec![0.0f32; n * W],
            &config,
            &mut |_| true,
            &|| false,
        );
        assert_eq!(outcome, DecodeOutcome::Completed);

        let flags: Vec<bool> = records.lock().iter().map(|r| r.no_context).collect();
        assert_eq!(flags, vec![false, false, true]);
    }

    #[test]
    fn job_level_reset_context_is_not_reapplied_per_range() {
        const W: usize = 1024;
        // Two ranges with a short gap between them.
        let probs = vec![
            0.9, 0.1, 0.1, 0.1, // range 1
            0.9, 0.1, 0.1, 0.1, // range 2, gap well under the threshold
        ];
        let n = probs.len();
        let vad = VadSegmenter::new(
            Box::new(ScriptedVad { probs, idx: 0 }),
            &vad_config(),
        );
        let (engine, records) = ScriptedEngine::new(vec![vec![], vec![]]);
        let mut transcriber = Transcriber::new(Box::new(engine), Some(vad));

        let mut config = DecodeConfig::default();
        config.use_vad = true;
        config.vad = vad_config();
        config.reset_context = true;

        let outcome = transcriber.transcribe(
            &vec![0.0f32; n * W],
            &config,
            &mut |_| true,
            &|| false,
        );
        assert_eq!(outcome, DecodeOutcome::Completed);

        // The engine state was reset once before the loop; no range is
        // individually marked no-context.
        let flags: Vec<bool> = records.lock().iter().map(|r| r.no_context).collect();
        assert_eq!(flags, vec![false, false]);
    }

    #[test]
    fn callback_stop_aborts_decode() {
        let (engine, _records) = ScriptedEngine::new(vec![vec![raw_segment(0, 100, "hello")]]);
        let mut transcriber = Transcriber::new(Box::new(engine), None);

        let outcome = transcriber.transcribe(
            &vec![0.0; 16_000],
            &DecodeConfig::default(),
            &mut |_| false,
            &|| false,
        );
        assert_eq!(outcome, DecodeOutcome::Aborted);
    }

    #[test]
    fn external_abort_wins_before_first_range() {
        let mut transcriber = Transcriber::new(Box::new(StubEngine::new()), None);
        let outcome = transcriber.transcribe(
            &vec![0.0; 16_000],
            &DecodeConfig::default(),
            &mut |_| true,
            &|| true,
        );
        assert_eq!(outcome, DecodeOutcome::Aborted);
    }
}
