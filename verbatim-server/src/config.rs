//! Command-line configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};

use crate::device::{EngineDeviceConfig, ImplicitOverride, CPU_DEVICE};

/// Minimum plausible size of a whisper GGML file when scanning the
/// models directory for a fallback.
const MODEL_SCAN_MIN_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "verbatim-server", version, about = "Transcription service")]
pub struct ServerConfig {
    /// Listen port
    #[arg(short, long, default_value_t = 9090, env = "VERBATIM_PORT")]
    pub port: u16,

    /// Path to the directory with models
    #[arg(short, long, default_value = "models")]
    pub models: PathBuf,

    /// Whisper model (GGML format)
    #[arg(short = 'w', long = "whisper", default_value = "")]
    pub whisper_model: String,

    /// Whisper DTW preset (tiny, tiny.en, base, base.en, small,
    /// small.en, medium, medium.en, large.v1, large.v2, large.v3)
    #[arg(long = "dtw", default_value = "")]
    pub whisper_dtw: String,

    /// VAD model (Silero VAD onnx); empty disables VAD
    #[arg(long = "vad", default_value = "silero_vad.onnx")]
    pub vad_model: String,

    /// Disable VAD
    #[arg(long = "no-vad")]
    pub no_vad: bool,

    /// Path to the static assets directory
    #[arg(short, long = "static", default_value = "static")]
    pub static_dir: PathBuf,

    /// Limit decode input duration in seconds (0 = unlimited)
    #[arg(short = 'l', long = "limit", default_value_t = 0)]
    pub limit_input_s: u32,

    /// VAD trim range in seconds
    #[arg(short = 'V', long = "trim", default_value_t = 20)]
    pub vad_trim_range_s: u32,

    /// Number of parallel decoder instances
    #[arg(short = 'P', long = "parallel", default_value_t = 2)]
    pub max_instances: usize,

    /// CPU only for the given engines (no argument = all)
    #[arg(long, num_args = 0..=1, default_missing_value = "all", value_name = "ENGINES")]
    pub cpu: Option<String>,

    /// GPU device per engine, e.g. whisper:1 (no argument = all:0)
    #[arg(long, num_args = 0..=1, default_missing_value = "all:0", value_name = "ENGINES")]
    pub gpu: Option<String>,

    /// Device per engine, e.g. whisper:cpu or whisper:gpu#1
    #[arg(short, long, value_name = "ENGINES")]
    pub device: Option<String>,

    /// SQLite document store path
    #[arg(long, default_value = "storage.sqlite")]
    pub storage: PathBuf,

    /// Add permissive CORS headers
    #[arg(long)]
    pub cors: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerConfig {
    /// Resolved whisper model path: the configured path, or the first
    /// plausible `*whisper*ggml*` file in the models directory.
    pub fn resolve_whisper_model(&self) -> Result<PathBuf> {
        let configured = resolve_path(&self.models, &self.whisper_model);
        if is_file(&configured) {
            return Ok(configured);
        }

        debug!(
            configured = %configured.display(),
            "whisper model not found, scanning models directory"
        );
        let entries = std::fs::read_dir(&self.models)
            .with_context(|| format!("reading models directory {}", self.models.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_file(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ext_ok = match path.extension().and_then(|e| e.to_str()) {
                None => true,
                Some("bin") | Some("ggml") => true,
                _ => false,
            };
            let big_enough = std::fs::metadata(&path)
                .map(|m| m.len() >= MODEL_SCAN_MIN_BYTES)
                .unwrap_or(false);
            if ext_ok && name.contains("whisper") && name.contains("ggml") && big_enough {
                info!(path = %path.display(), "using scanned whisper model");
                return Ok(path);
            }
        }

        bail!(
            "no whisper model found: {} does not exist and no *whisper*ggml* candidate in {}",
            configured.display(),
            self.models.display()
        );
    }

    /// Resolved VAD model path; `None` when VAD is disabled.
    pub fn resolve_vad_model(&self) -> Option<PathBuf> {
        if self.no_vad || self.vad_model.is_empty() {
            return None;
        }
        Some(resolve_path(&self.models, &self.vad_model))
    }

    /// Fold the `--cpu` / `--gpu` / `--device` flags into the engine
    /// device configuration, in that order.
    pub fn apply_device_flags(&self, conf: &mut EngineDeviceConfig) -> Result<()> {
        if let Some(engines) = &self.cpu {
            conf.apply(engines, CPU_DEVICE, ImplicitOverride::NotAllowed)?;
        }
        if let Some(engines) = &self.gpu {
            conf.apply(engines, 0, ImplicitOverride::Allowed)?;
        }
        if let Some(engines) = &self.device {
            conf.apply(engines, 0, ImplicitOverride::Required)?;
        }
        Ok(())
    }

    /// Upload cap: generous headroom over the configured input limit,
    /// or 1 GiB when unlimited.
    pub fn payload_limit_bytes(&self) -> usize {
        if self.limit_input_s > 0 {
            let audio = 2 * 16_000 * self.limit_input_s as usize;
            (10 * 1024 * 1024).max(1024 * 1024 + audio)
        } else {
            1024 * 1024 * 1024
        }
    }
}

/// Absolute and explicitly relative paths are taken as-is; bare names
/// resolve under `prefix`.
fn resolve_path(prefix: &Path, path: &str) -> PathBuf {
    let as_path = Path::new(path);
    if as_path.is_absolute() || path.starts_with("./") || path.starts_with("../") {
        return as_path.to_path_buf();
    }
    prefix.join(path)
}

fn is_file(path: &Path) -> bool {
    // Follows symlinks.
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
