//! # verbatim-core
//!
//! Asynchronous transcription job engine.
//!
//! ## Architecture
//!
//! ```text
//! WAV upload → JobRequest → JobDispatcher (FIFO, ≤ max_instances workers)
//!                                │
//!                      Transcriber (one per worker)
//!                      │                │
//!               VadSegmenter      SpeechEngine
//!                (ranges)       (stub / whisper)
//!                                │
//!                  job.segments append + notify_all
//!                                │
//!                    waiters (blocking / streaming)
//! ```
//!
//! Workers are OS threads; waiters block on the job's condition
//! variable. Heavy model backends are feature-gated (`onnx` for the
//! Silero VAD, `whisper` for the acoustic model); default builds use a
//! deterministic stub engine.

// Denied (not forbidden) so the whisper FFI module can opt back in for
// its C callback trampolines.
#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod decode;
pub mod error;
pub mod jobs;
pub mod transcript;
pub mod vad;

// Convenience re-exports for downstream crates
pub use decode::{DecodeConfig, DecodeOutcome, DecoderFactory, StubEngine, Transcriber};
pub use error::CoreError;
pub use jobs::{JobDispatcher, JobId, JobRequest, JobStatus};
pub use transcript::{Segment, Token, TranscriptResult};
pub use vad::{VadConfig, VadSegmenter};

#[cfg(feature = "onnx")]
pub use vad::SileroVad;

#[cfg(feature = "whisper")]
pub use decode::{WhisperEngine, WhisperModel};
