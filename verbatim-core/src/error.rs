use thiserror::Error;

/// All errors produced by verbatim-core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
