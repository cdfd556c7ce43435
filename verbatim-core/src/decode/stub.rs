//! `StubEngine` — deterministic backend without real inference.
//!
//! Emits one synthetic segment per second of audio so the job engine,
//! waiter protocol, and HTTP surface can be exercised end-to-end with
//! no model weights present. Build with the `whisper` feature for real
//! transcription.

use tracing::debug;

use super::{DecodeHooks, EngineError, EngineParams, RawSegment, RawToken, SpeechEngine};

/// Samples per synthetic segment (1 s at 16 kHz).
const SPAN_SAMPLES: usize = 16_000;
/// 10 ms timestamp units per synthetic segment.
const SPAN_T: i64 = 100;

pub struct StubEngine {
    lang: Option<String>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self { lang: None }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechEngine for StubEngine {
    fn run(
        &mut self,
        samples: &[f32],
        params: &EngineParams<'_>,
        hooks: &mut DecodeHooks<'_>,
    ) -> Result<(), EngineError> {
        let lang = params.lang.unwrap_or("en").to_string();
        self.lang = Some(lang.clone());

        let count = samples.len().div_ceil(SPAN_SAMPLES).max(1);
        debug!(samples = samples.len(), segments = count, "stub decode");

        for i in 0..count {
            if (hooks.should_abort)() {
                return Err(EngineError::Aborted);
            }

            let t0 = i as i64 * SPAN_T;
            let t1 = (((i + 1) * SPAN_SAMPLES).min(samples.len()) as i64) / 160;
            let text = format!("[stub segment {i}]");
            let segment = RawSegment {
                t0,
                t1,
                turn_next: false,
                text: text.clone(),
                lang: lang.clone(),
                tokens: vec![RawToken {
                    id: i as i32,
                    tid: 50364,
                    p: 0.9,
                    plog: -0.1,
                    pt: 0.9,
                    ptsum: 0.9,
                    t0,
                    t1,
                    t_dtw: t0,
                    vlen: text.len() as f32,
                    special: false,
                    text: text.into_bytes(),
                }],
            };

            if !(hooks.on_segments)(vec![segment]) {
                return Err(EngineError::Aborted);
            }
        }

        Ok(())
    }

    fn detected_language(&self) -> Option<String> {
        self.lang.clone()
    }

    fn reset(&mut self) {
        debug!("stub reset");
        self.lang = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_one_segment_per_second() {
        let mut engine = StubEngine::new();
        let samples = vec![0.0f32; SPAN_SAMPLES * 3];
        let mut collected = Vec::new();

        let mut on_segments = |batch: Vec<RawSegment>| {
            collected.extend(batch);
            true
        };
        let should_abort = || false;
        let mut hooks = DecodeHooks {
            on_segments: &mut on_segments,
            should_abort: &should_abort,
        };

        engine
            .run(&samples, &EngineParams::default(), &mut hooks)
            .expect("stub run");

        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].t0, 0);
        assert_eq!(collected[1].t0, SPAN_T);
        assert_eq!(engine.detected_language().as_deref(), Some("en"));
    }

    #[test]
    fn stops_when_sink_declines() {
        let mut engine = StubEngine::new();
        let samples = vec![0.0f32; SPAN_SAMPLES * 4];
        let mut seen = 0usize;

        let mut on_segments = |_batch: Vec<RawSegment>| {
            seen += 1;
            seen < 2
        };
        let should_abort = || false;
        let mut hooks = DecodeHooks {
            on_segments: &mut on_segments,
            should_abort: &should_abort,
        };

        let result = engine.run(&samples, &EngineParams::default(), &mut hooks);
        assert!(matches!(result, Err(EngineError::Aborted)));
        assert_eq!(seen, 2);
    }

    #[test]
    fn abort_query_is_polled_between_segments() {
        let mut engine = StubEngine::new();
        let samples = vec![0.0f32; SPAN_SAMPLES * 4];

        let mut delivered = 0usize;
        let mut on_segments = |_batch: Vec<RawSegment>| {
            delivered += 1;
            true
        };
        let should_abort = || true;
        let mut hooks = DecodeHooks {
            on_segments: &mut on_segments,
            should_abort: &should_abort,
        };

        let result = engine.run(&samples, &EngineParams::default(), &mut hooks);
        assert!(matches!(result, Err(EngineError::Aborted)));
        assert_eq!(delivered, 0);
    }
}
