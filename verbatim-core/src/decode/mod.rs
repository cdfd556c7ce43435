//! Acoustic decoding: the backend seam and the per-job driver.
//!
//! `SpeechEngine` decouples the driver from any specific backend
//! (deterministic stub, whisper.cpp via FFI, …). `&mut self` on `run`
//! intentionally expresses that decoders are stateful — text context,
//! KV caches, detected language. Each worker owns exactly one engine.

pub mod driver;
pub mod stitch;
pub mod stub;

#[cfg(feature = "whisper")]
pub mod whisper;

pub use driver::{DecodeOutcome, DecoderFactory, Transcriber};
pub use stub::StubEngine;

#[cfg(feature = "whisper")]
pub use whisper::{WhisperEngine, WhisperModel};

use serde::{Deserialize, Serialize};

use crate::vad::VadConfig;

/// Per-job decoding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Language code, or `"auto"`/empty to detect on the first call.
    pub lang: String,
    /// Translate to English instead of transcribing.
    pub translate: bool,
    /// Reinitialize decoder state before this job.
    pub reset_context: bool,
    /// Gate decoding on detected speech ranges.
    pub use_vad: bool,
    /// Decoder thread count; 0 = backend default.
    pub n_threads: i32,
    /// Start offset into the buffer, ms.
    pub offset_ms: i32,
    /// Duration to process, ms; 0 = full buffer.
    pub duration_ms: i32,
    /// Force a context reset for a VAD range preceded by at least this
    /// much non-speech.
    pub reset_min_nospeech_ms: u32,
    pub vad: VadConfig,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            lang: "auto".into(),
            translate: false,
            reset_context: false,
            use_vad: false,
            n_threads: 0,
            offset_ms: 0,
            duration_ms: 0,
            reset_min_nospeech_ms: 10_000,
            vad: VadConfig::default(),
        }
    }
}

impl DecodeConfig {
    /// The language hint handed to the engine; `None` requests
    /// detection.
    pub fn lang_hint(&self) -> Option<&str> {
        match self.lang.as_str() {
            "" | "auto" => None,
            lang => Some(lang),
        }
    }
}

/// Per-run parameter view handed to the backend.
#[derive(Debug, Clone, Default)]
pub struct EngineParams<'a> {
    /// `None` = detect and commit language on this run.
    pub lang: Option<&'a str>,
    pub translate: bool,
    /// Do not carry text context from the previous run.
    pub no_context: bool,
    pub n_threads: i32,
    pub offset_ms: i32,
    pub duration_ms: i32,
}

/// Backend-side token. `text` is raw bytes: the acoustic tokenizer may
/// split a multi-byte UTF-8 codepoint across successive tokens, so the
/// driver stitches before any `String` exists.
#[derive(Debug, Clone)]
pub struct RawToken {
    pub id: i32,
    pub tid: i32,
    pub p: f32,
    pub plog: f32,
    pub pt: f32,
    pub ptsum: f32,
    pub t0: i64,
    pub t1: i64,
    pub t_dtw: i64,
    pub vlen: f32,
    pub special: bool,
    pub text: Vec<u8>,
}

/// Backend-side segment, timestamps relative to the decoded slice.
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub t0: i64,
    pub t1: i64,
    pub turn_next: bool,
    pub text: String,
    pub lang: String,
    pub tokens: Vec<RawToken>,
}

/// Failure modes of one backend run.
#[derive(Debug)]
pub enum EngineError {
    /// The abort query tripped or the segment sink asked to stop.
    Aborted,
    /// The model returned an error; decoder state is suspect.
    Model(String),
}

/// Callback pair installed for each decode run.
///
/// `on_segments` is invoked with every batch of newly completed
/// segments; returning `false` asks the backend to stop. `should_abort`
/// is polled between decode steps.
pub struct DecodeHooks<'a> {
    pub on_segments: &'a mut dyn FnMut(Vec<RawSegment>) -> bool,
    pub should_abort: &'a dyn Fn() -> bool,
}

/// Contract for acoustic decoding backends.
pub trait SpeechEngine: Send {
    /// Run one decode pass over `samples` (mono f32 at 16 kHz),
    /// delivering new segments through `hooks`.
    fn run(
        &mut self,
        samples: &[f32],
        params: &EngineParams<'_>,
        hooks: &mut DecodeHooks<'_>,
    ) -> std::result::Result<(), EngineError>;

    /// Language committed by the most recent run, if any.
    fn detected_language(&self) -> Option<String>;

    /// Drop all decoding state (text context, caches).
    fn reset(&mut self);
}
