//! Transcript wire types.
//!
//! Timestamps (`t0`, `t1`, `t_dtw`) are in 10 ms units, matching the
//! acoustic model's native resolution. `t0`/`t1` serialize as
//! `start`/`end` on the wire.

use serde::{Deserialize, Serialize};

/// The acoustic model's smallest output unit, with probability and
/// timing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i32,
    /// Forced timestamp token id.
    pub tid: i32,

    /// Probability of the token.
    pub p: f32,
    /// Log probability of the token.
    pub plog: f32,
    /// Probability of the timestamp token.
    pub pt: f32,
    /// Sum of probabilities of all timestamp tokens.
    pub ptsum: f32,

    #[serde(rename = "start")]
    pub t0: i64,
    #[serde(rename = "end")]
    pub t1: i64,
    /// DTW-aligned timestamp; only meaningful when DTW token
    /// timestamps were computed.
    pub t_dtw: i64,

    /// Voice length of the token.
    pub vlen: f32,

    /// Control token (id at or above end-of-transcript). Never merged.
    pub special: bool,

    pub text: String,
}

/// A contiguous block of transcribed text produced by one decoder step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "start")]
    pub t0: i64,
    #[serde(rename = "end")]
    pub t1: i64,
    pub text: String,
    /// Speaker-turn hint from the diarization head.
    pub turn_next: bool,
    pub tokens: Vec<Token>,
    pub lang: String,
}

/// Complete result of one synchronous decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub lang: String,
    pub segments: Vec<Segment>,
}
