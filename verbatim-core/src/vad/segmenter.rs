//! Speech-range segmentation over a PCM buffer.
//!
//! `VadSegmenter` slides a fixed window across the buffer, asks the
//! backend for a per-window speech probability, and tracks a small state
//! machine: `triggered` (speech in progress), a pending `temp_end`
//! (below-threshold run inside speech), and a speculative `next_start`
//! (above-threshold after silence). Ranges come out of a lazy,
//! single-pass iterator — pulling one range advances the model only far
//! enough to emit it.

use tracing::error;

use super::{SpeechRange, VadBackend, VadConfig};

/// Silence run that arms `prev_end` as a fallback close point when the
/// max-speech cap fires (98 ms, matching the upstream Silero pipeline).
const MIN_SILENCE_AT_MAX_SPEECH_MS: usize = 98;

/// Probability margin below `threshold` treated as a soft region:
/// no transition in either direction.
const NEGATIVE_THRESHOLD_MARGIN: f32 = 0.15;

pub struct VadSegmenter {
    backend: Box<dyn VadBackend>,

    window_size: usize,
    min_speech_samples: usize,
    min_silence_samples: usize,
    min_silence_at_max_speech: usize,
    /// f64 so the default (no cap) is representable as infinity.
    max_speech_samples: f64,
    threshold: f32,

    // run state
    triggered: bool,
    current_sample: usize,
    current_start: Option<usize>,
    /// Candidate end inside a below-threshold run; 0 = unset.
    temp_end: usize,
    /// Last silence-confirmed end, used when the max-speech cap closes.
    prev_end: usize,
    /// Speculative start of a follow-up region after `prev_end`.
    next_start: usize,
}

impl VadSegmenter {
    pub fn new(backend: Box<dyn VadBackend>, config: &VadConfig) -> Self {
        let mut segmenter = Self {
            backend,
            window_size: 0,
            min_speech_samples: 0,
            min_silence_samples: 0,
            min_silence_at_max_speech: 0,
            max_speech_samples: f64::INFINITY,
            threshold: 0.0,
            triggered: false,
            current_sample: 0,
            current_start: None,
            temp_end: 0,
            prev_end: 0,
            next_start: 0,
        };
        segmenter.reconfigure(config);
        segmenter
    }

    /// Recompute the derived sample counts for a (possibly per-job)
    /// config. Keeps the backend; clears nothing — call before
    /// `segment`, which resets the run state anyway.
    pub fn reconfigure(&mut self, config: &VadConfig) {
        let sr_per_ms = (config.sample_rate / 1000).max(1) as usize;
        let window_size = sr_per_ms * config.window_ms.max(1) as usize;
        let speech_pad_samples = sr_per_ms * config.speech_pad_ms as usize;

        self.window_size = window_size;
        self.min_speech_samples = sr_per_ms * config.min_speech_ms as usize;
        self.min_silence_samples = sr_per_ms * config.min_silence_ms as usize;
        self.min_silence_at_max_speech = sr_per_ms * MIN_SILENCE_AT_MAX_SPEECH_MS;
        self.max_speech_samples = config.sample_rate as f64 * config.max_speech_s as f64
            - window_size as f64
            - 2.0 * speech_pad_samples as f64;
        self.threshold = config.threshold;
    }

    /// Zero the backend's hidden state and the range state machine.
    /// Called once at the start of each job.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.triggered = false;
        self.current_sample = 0;
        self.current_start = None;
        self.temp_end = 0;
        self.prev_end = 0;
        self.next_start = 0;
    }

    /// Lazy iterator of speech ranges over `samples`. Resets first;
    /// single-pass, strictly monotone.
    pub fn segment<'a>(&'a mut self, samples: &'a [f32]) -> SpeechRanges<'a> {
        self.reset();
        SpeechRanges {
            segmenter: self,
            samples,
            cursor: 0,
            flushed: false,
        }
    }

    /// Feed one window; returns a range when this window closes one.
    fn step(&mut self, window: &[f32]) -> Option<SpeechRange> {
        let prob = match self.backend.predict(window) {
            Ok(p) => p,
            Err(e) => {
                error!("VAD inference error: {e}");
                0.0
            }
        };

        self.current_sample += self.window_size;

        if prob >= self.threshold {
            if self.temp_end != 0 {
                self.temp_end = 0;
                if self.next_start < self.prev_end {
                    self.next_start = self.current_sample - self.window_size;
                }
            }
            if !self.triggered {
                self.triggered = true;
                self.current_start = Some(self.current_sample - self.window_size);
            }
            return None;
        }

        if self.triggered {
            let start = self.current_start.unwrap_or(0);
            if (self.current_sample - start) as f64 > self.max_speech_samples {
                return Some(self.close_at_max_speech(start));
            }
        }

        if prob >= self.threshold - NEGATIVE_THRESHOLD_MARGIN {
            // Soft region: neither confirms speech nor counts as silence.
            return None;
        }

        // Hard silence.
        if self.triggered {
            if self.temp_end == 0 {
                self.temp_end = self.current_sample;
            }
            if self.current_sample - self.temp_end > self.min_silence_at_max_speech {
                self.prev_end = self.temp_end;
            }
            if self.current_sample - self.temp_end >= self.min_silence_samples {
                let start = self.current_start.unwrap_or(0);
                let end = self.temp_end;
                if end.saturating_sub(start) > self.min_speech_samples {
                    self.clear_range_state();
                    self.triggered = false;
                    return Some(SpeechRange { start, end });
                }
            }
        }

        None
    }

    /// A region hit the max-speech cap: close at the last confirmed
    /// silence if one exists, else right here; restart immediately
    /// unless silence was already established.
    fn close_at_max_speech(&mut self, start: usize) -> SpeechRange {
        if self.prev_end > 0 {
            let range = SpeechRange {
                start,
                end: self.prev_end,
            };
            if self.next_start < self.prev_end {
                self.triggered = false;
                self.current_start = None;
            } else {
                self.current_start = Some(self.next_start);
            }
            self.prev_end = 0;
            self.next_start = 0;
            self.temp_end = 0;
            range
        } else {
            let range = SpeechRange {
                start,
                end: self.current_sample,
            };
            self.clear_range_state();
            self.triggered = false;
            range
        }
    }

    /// End-of-buffer flush: close any open region at the buffer end.
    fn flush(&mut self, buffer_len: usize) -> Option<SpeechRange> {
        let start = self.current_start?;
        self.clear_range_state();
        self.triggered = false;
        Some(SpeechRange {
            start,
            end: buffer_len,
        })
    }

    fn clear_range_state(&mut self) {
        self.current_start = None;
        self.prev_end = 0;
        self.next_start = 0;
        self.temp_end = 0;
    }
}

/// Forward-only iterator over detected speech ranges.
pub struct SpeechRanges<'a> {
    segmenter: &'a mut VadSegmenter,
    samples: &'a [f32],
    cursor: usize,
    flushed: bool,
}

impl Iterator for SpeechRanges<'_> {
    type Item = SpeechRange;

    fn next(&mut self) -> Option<SpeechRange> {
        let window = self.segmenter.window_size;
        loop {
            if self.cursor + window > self.samples.len() {
                if self.flushed {
                    return None;
                }
                self.flushed = true;
                return self.segmenter.flush(self.samples.len());
            }

            let slice = &self.samples[self.cursor..self.cursor + window];
            self.cursor += window;

            if let Some(range) = self.segmenter.step(slice) {
                return Some(range);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    /// Backend that replays a fixed probability script, one per window.
    struct ScriptedBackend {
        probs: Vec<f32>,
        idx: usize,
    }

    impl ScriptedBackend {
        fn new(probs: Vec<f32>) -> Self {
            Self { probs, idx: 0 }
        }
    }

    impl VadBackend for ScriptedBackend {
        fn predict(&mut self, _window: &[f32]) -> Result<f32> {
            let p = self.probs.get(self.idx).copied().unwrap_or(0.0);
            self.idx += 1;
            Ok(p)
        }

        fn reset(&mut self) {
            self.idx = 0;
        }
    }

    fn config() -> VadConfig {
        VadConfig {
            sample_rate: 16_000,
            window_ms: 64, // 1024 samples
            threshold: 0.5,
            min_silence_ms: 128, // 2 windows
            speech_pad_ms: 0,
            min_speech_ms: 64, // 1 window
            max_speech_s: f32::INFINITY,
        }
    }

    const W: usize = 1024;

    fn ranges(probs: Vec<f32>, config: &VadConfig) -> Vec<SpeechRange> {
        let n = probs.len();
        let mut segmenter = VadSegmenter::new(Box::new(ScriptedBackend::new(probs)), config);
        let samples = vec![0.0f32; n * W];
        segmenter.segment(&samples).collect()
    }

    #[test]
    fn speech_then_long_silence_closes_at_first_silent_window() {
        // 3 speech windows, then 4 hard-silence windows.
        let probs = vec![0.9, 0.9, 0.9, 0.1, 0.1, 0.1, 0.1];
        let out = ranges(probs, &config());
        assert_eq!(
            out,
            vec![SpeechRange {
                start: 0,
                end: 4 * W
            }]
        );
    }

    #[test]
    fn open_region_flushes_at_buffer_end() {
        let probs = vec![0.2, 0.8, 0.8, 0.8];
        let out = ranges(probs, &config());
        assert_eq!(
            out,
            vec![SpeechRange {
                start: W,
                end: 4 * W
            }]
        );
    }

    #[test]
    fn soft_band_neither_opens_nor_closes() {
        // 0.4 is within threshold - 0.15: not speech, not silence.
        let probs = vec![0.9, 0.4, 0.4, 0.4, 0.4, 0.4, 0.4, 0.4];
        let out = ranges(probs, &config());
        // Region stays open through the soft band and flushes at the end.
        assert_eq!(
            out,
            vec![SpeechRange {
                start: 0,
                end: 8 * W
            }]
        );
    }

    #[test]
    fn blip_below_min_speech_defers_close_and_merges_forward() {
        let mut cfg = config();
        cfg.min_speech_ms = 192; // 3 windows

        // A single speech window is too short to close on silence; the
        // region stays open and merges with the next speech burst into
        // one range that closes at the burst's confirmed end.
        let probs = vec![0.1, 0.9, 0.1, 0.1, 0.1, 0.9, 0.9, 0.9, 0.1, 0.1, 0.1];
        let out = ranges(probs, &cfg);
        assert_eq!(
            out,
            vec![SpeechRange {
                start: W,
                end: 9 * W
            }]
        );
    }

    #[test]
    fn two_regions_emitted_in_order() {
        let probs = vec![
            0.9, 0.9, 0.1, 0.1, 0.1, // region 1 closes at window 3
            0.9, 0.9, 0.1, 0.1, 0.1, // region 2 closes at window 8
        ];
        let out = ranges(probs, &config());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], SpeechRange { start: 0, end: 3 * W });
        assert_eq!(
            out[1],
            SpeechRange {
                start: 5 * W,
                end: 8 * W
            }
        );
        assert!(out[0].end <= out[1].start, "ranges must be monotone");
    }

    #[test]
    fn max_speech_cap_closes_at_current_sample_without_prior_silence() {
        let mut cfg = config();
        cfg.min_silence_ms = 640; // 10 windows: silence alone never closes
        // Cap at 4 windows (one window is subtracted inside the formula).
        cfg.max_speech_s = 5.0 * W as f32 / 16_000.0;

        // 6 speech windows, then a dip that trips the cap check.
        let probs = vec![0.9, 0.9, 0.9, 0.9, 0.9, 0.9, 0.1, 0.1];
        let out = ranges(probs, &cfg);

        // No confirmed silence inside the region: forced close at the
        // sample where the cap was detected.
        assert_eq!(
            out,
            vec![SpeechRange {
                start: 0,
                end: 7 * W
            }]
        );
    }

    #[test]
    fn max_speech_cap_closes_at_prev_end_and_restarts() {
        let mut cfg = config();
        cfg.min_silence_ms = 640; // 10 windows: silence alone never closes
        cfg.max_speech_s = 9.0 * W as f32 / 16_000.0; // cap = 8 windows

        // Speech, a 3-window dip (arms prev_end after 98 ms of silence),
        // speech again (arms next_start), then a dip long enough to trip
        // the cap.
        let probs = vec![0.9, 0.9, 0.1, 0.1, 0.1, 0.9, 0.1, 0.1, 0.1, 0.1];
        let out = ranges(probs, &cfg);

        // The capped region closes at the last confirmed silence point
        // (3 windows in) and a follow-up region restarts at next_start,
        // flushing at the buffer end.
        assert_eq!(
            out,
            vec![
                SpeechRange { start: 0, end: 3 * W },
                SpeechRange {
                    start: 5 * W,
                    end: 10 * W
                },
            ]
        );
    }

    #[test]
    fn iterator_is_lazy() {
        let probs = vec![0.9, 0.9, 0.1, 0.1, 0.1, 0.9, 0.9, 0.9];
        let n = probs.len();
        let mut segmenter = VadSegmenter::new(Box::new(ScriptedBackend::new(probs)), &config());
        let samples = vec![0.0f32; n * W];

        let mut iter = segmenter.segment(&samples);
        let first = iter.next().expect("first range");
        assert_eq!(first, SpeechRange { start: 0, end: 3 * W });
        // The second region is still open; dropping the iterator here
        // must be fine (single-pass, no exhaustion required).
        drop(iter);
    }

    #[test]
    fn segment_resets_backend_between_jobs() {
        let probs = vec![0.9, 0.1, 0.1, 0.1];
        let n = probs.len();
        let mut segmenter = VadSegmenter::new(Box::new(ScriptedBackend::new(probs)), &config());
        let samples = vec![0.0f32; n * W];

        let first: Vec<_> = segmenter.segment(&samples).collect();
        let second: Vec<_> = segmenter.segment(&samples).collect();
        assert_eq!(first, second, "each job must start from a clean state");
    }
}
