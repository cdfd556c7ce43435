//! Voice activity detection.
//!
//! The `VadBackend` trait is the extensibility point: it turns one
//! fixed-size window of samples into a speech probability. The
//! `VadSegmenter` drives a backend across a whole buffer and emits
//! speech ranges lazily.

pub mod segmenter;

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroVad;

pub use segmenter::VadSegmenter;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A `(start_sample, end_sample)` span of detected speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechRange {
    pub start: usize,
    pub end: usize,
}

impl SpeechRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// VAD tuning parameters, all durations in source-time units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Sample rate of the analysed buffer (Hz).
    pub sample_rate: u32,
    /// Analysis window length in ms (64 ms = 1024 samples at 16 kHz).
    pub window_ms: u32,
    /// Speech probability threshold in [0, 1].
    pub threshold: f32,
    /// Silence run required to close a speech region.
    pub min_silence_ms: u32,
    /// Padding applied around detected speech.
    pub speech_pad_ms: u32,
    /// Minimum duration for a region to count as speech.
    pub min_speech_ms: u32,
    /// Hard cap on a single speech region, seconds. Infinite by default.
    pub max_speech_s: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window_ms: 64,
            threshold: 0.5,
            min_silence_ms: 2_000,
            speech_pad_ms: 64,
            min_speech_ms: 64,
            max_speech_s: f32::INFINITY,
        }
    }
}

/// Per-window speech probability model.
///
/// Implementors are stateful (RNN hidden/cell state); `reset` returns
/// them to the initial state and is called once per job.
pub trait VadBackend: Send {
    /// Probability of speech in one window of samples.
    fn predict(&mut self, window: &[f32]) -> Result<f32>;

    /// Zero all hidden state.
    fn reset(&mut self);
}
