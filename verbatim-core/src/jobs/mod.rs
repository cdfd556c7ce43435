//! Asynchronous transcription jobs.
//!
//! A job is one transcription request: its audio, config, lifecycle
//! status, and the segments delivered so far. Jobs are keyed by an
//! opaque 6-character id and processed by a bounded worker pool.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::JobDispatcher;
pub use registry::JobRegistry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decode::DecodeConfig;

/// Opaque job identifier (6 alphanumeric characters).
pub type JobId = String;

/// Five-valued job lifecycle. Transitions are strictly forward:
/// `Waiting → Running → {Done | Failed | Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Done,
    Failed,
    Aborted,
}

impl JobStatus {
    /// Terminal jobs are immutable: segments and status never change.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }
}

/// Immutable request fields of a job.
///
/// `samples` is the pre-materialized mono 16 kHz PCM buffer; `wav`
/// optionally keeps the original upload for archival.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub samples: Arc<Vec<f32>>,
    pub wav: Option<Arc<Vec<u8>>>,
    pub config: DecodeConfig,
}

impl JobRequest {
    pub fn new(samples: Vec<f32>, config: DecodeConfig) -> Self {
        Self {
            samples: Arc::new(samples),
            wav: None,
            config,
        }
    }

    pub fn with_wav(mut self, wav: Vec<u8>) -> Self {
        self.wav = Some(Arc::new(wav));
        self
    }
}
