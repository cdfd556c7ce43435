//! Shared application state and the per-worker decoder factory.

use std::path::PathBuf;
use std::sync::Arc;

use verbatim_core::{DecoderFactory, JobDispatcher, Transcriber};

use crate::storage::Storage;

#[cfg(feature = "whisper")]
use verbatim_core::WhisperModel;

#[cfg(not(feature = "whisper"))]
use verbatim_core::StubEngine;

/// Decode limits advertised on `/api/config` and enforced on uploads.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub limit_input_s: u32,
    pub vad_trim_range_s: u32,
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<JobDispatcher>,
    pub storage: Storage,
    pub factory: Arc<dyn DecoderFactory>,
    pub limits: DecodeLimits,
}

/// Builds decoders from process-wide shared model resources: whisper
/// weights (or the stub engine in weightless builds) plus the optional
/// Silero VAD.
pub struct ModelFactory {
    #[cfg(feature = "whisper")]
    whisper: WhisperModel,
    vad_model_path: Option<PathBuf>,
}

impl ModelFactory {
    #[cfg(feature = "whisper")]
    pub fn new(whisper: WhisperModel, vad_model_path: Option<PathBuf>) -> Self {
        Self {
            whisper,
            vad_model_path,
        }
    }

    #[cfg(not(feature = "whisper"))]
    pub fn new(vad_model_path: Option<PathBuf>) -> Self {
        Self { vad_model_path }
    }

    fn build_engine(&self) -> Box<dyn verbatim_core::decode::SpeechEngine> {
        #[cfg(feature = "whisper")]
        {
            Box::new(verbatim_core::WhisperEngine::new(self.whisper.clone()))
        }
        #[cfg(not(feature = "whisper"))]
        {
            Box::new(StubEngine::new())
        }
    }

    fn build_segmenter(&self) -> Option<verbatim_core::VadSegmenter> {
        let path = self.vad_model_path.as_ref()?;

        #[cfg(feature = "onnx")]
        {
            use verbatim_core::{SileroVad, VadConfig, VadSegmenter};
            match SileroVad::new(path, 16_000) {
                Ok(backend) => Some(VadSegmenter::new(
                    Box::new(backend),
                    &VadConfig::default(),
                )),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        "VAD model failed to load, falling back to whole-buffer decoding: {e}"
                    );
                    None
                }
            }
        }

        #[cfg(not(feature = "onnx"))]
        {
            tracing::warn!(
                path = %path.display(),
                "VAD model configured but this build has no onnx feature; decoding whole buffers"
            );
            None
        }
    }
}

impl DecoderFactory for ModelFactory {
    fn new_decoder(&self) -> Transcriber {
        Transcriber::new(self.build_engine(), self.build_segmenter())
    }
}
