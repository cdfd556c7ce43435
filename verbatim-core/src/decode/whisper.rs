//! whisper.cpp acoustic backend via `whisper-rs`.
//!
//! The model weights (`WhisperModel`) are loaded once per process and
//! shared read-only; each worker's `WhisperEngine` owns its own
//! decoding state. Incremental delivery and cancellation go through
//! C-style trampolines: whisper.cpp hands back an opaque user-data
//! pointer which we point at a per-run bridge struct.

#![allow(unsafe_code)]

use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use whisper_rs::{
    DtwMode, DtwModelPreset, DtwParameters, FullParams, SamplingStrategy, WhisperContext,
    WhisperContextParameters, WhisperState,
};

use super::{DecodeHooks, EngineError, EngineParams, RawSegment, RawToken, SpeechEngine};
use crate::error::{CoreError, Result};

/// Process-wide shared whisper weights.
#[derive(Clone)]
pub struct WhisperModel {
    ctx: Arc<WhisperContext>,
}

impl WhisperModel {
    /// Load GGML weights. `dtw` selects the token-timestamp alignment
    /// preset (`tiny`, `base.en`, `large.v3`, …); unknown names disable
    /// DTW with a warning.
    pub fn load(
        path: impl AsRef<Path>,
        dtw: Option<&str>,
        use_gpu: bool,
        gpu_device: i32,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CoreError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let mut params = WhisperContextParameters::default();
        params.use_gpu(use_gpu);
        params.gpu_device(gpu_device);
        params.flash_attn(true);

        if let Some(name) = dtw.filter(|name| !name.is_empty()) {
            match dtw_preset(name) {
                Some(preset) => {
                    params.dtw_parameters(DtwParameters {
                        mode: DtwMode::ModelPreset {
                            model_preset: preset,
                        },
                        ..Default::default()
                    });
                }
                None => warn!(preset = name, "unknown DTW preset, token DTW disabled"),
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| CoreError::BadInput("non-UTF-8 model path".into()))?;
        let ctx = WhisperContext::new_with_params(path_str, params)
            .map_err(|e| CoreError::Decoder(format!("failed to load whisper model: {e}")))?;

        info!(path = %path.display(), use_gpu, gpu_device, "whisper model loaded");
        Ok(Self { ctx: Arc::new(ctx) })
    }
}

fn dtw_preset(name: &str) -> Option<DtwModelPreset> {
    Some(match name {
        "tiny" => DtwModelPreset::Tiny,
        "tiny.en" => DtwModelPreset::TinyEn,
        "base" => DtwModelPreset::Base,
        "base.en" => DtwModelPreset::BaseEn,
        "small" => DtwModelPreset::Small,
        "small.en" => DtwModelPreset::SmallEn,
        "medium" => DtwModelPreset::Medium,
        "medium.en" => DtwModelPreset::MediumEn,
        "large.v1" => DtwModelPreset::LargeV1,
        "large.v2" => DtwModelPreset::LargeV2,
        "large.v3" => DtwModelPreset::LargeV3,
        _ => return None,
    })
}

/// Per-run data the C trampolines operate on.
struct Bridge<'a, 'b> {
    hooks: &'a mut DecodeHooks<'b>,
    /// End-of-transcript token id; ids at or above it are special.
    eot: i32,
    /// Set when the segment sink declines further output.
    stop: bool,
    /// Language of the most recent segment batch.
    lang: Option<String>,
}

/// One decoder instance; holds reusable decoding state between jobs
/// unless a context reset is requested.
pub struct WhisperEngine {
    model: WhisperModel,
    state: Option<WhisperState>,
    lang: Option<String>,
}

impl WhisperEngine {
    pub fn new(model: WhisperModel) -> Self {
        Self {
            model,
            state: None,
            lang: None,
        }
    }
}

impl SpeechEngine for WhisperEngine {
    fn run(
        &mut self,
        samples: &[f32],
        params: &EngineParams<'_>,
        hooks: &mut DecodeHooks<'_>,
    ) -> std::result::Result<(), EngineError> {
        if self.state.is_none() {
            let state = self
                .model
                .ctx
                .create_state()
                .map_err(|e| EngineError::Model(format!("failed to create state: {e}")))?;
            self.state = Some(state);
        }

        let mut bridge = Bridge {
            hooks,
            eot: self.model.ctx.token_eot(),
            stop: false,
            lang: None,
        };

        let mut fp = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        fp.set_language(Some(params.lang.unwrap_or("auto")));
        fp.set_translate(params.translate);
        fp.set_no_context(params.no_context);
        if params.n_threads > 0 {
            fp.set_n_threads(params.n_threads);
        }
        fp.set_offset_ms(params.offset_ms);
        fp.set_duration_ms(params.duration_ms);
        fp.set_token_timestamps(true);
        fp.set_tdrz_enable(true);
        fp.set_suppress_blank(false);
        fp.set_print_special(false);
        fp.set_print_progress(false);
        fp.set_print_realtime(false);
        fp.set_print_timestamps(false);

        let bridge_ptr: *mut c_void = (&mut bridge as *mut Bridge<'_, '_>).cast();
        unsafe {
            fp.set_new_segment_callback(Some(new_segment_trampoline));
            fp.set_new_segment_callback_user_data(bridge_ptr);
            fp.set_abort_callback(Some(abort_trampoline));
            fp.set_abort_callback_user_data(bridge_ptr);
        }

        let state = self.state.as_mut().expect("state initialized above");
        debug!(samples = samples.len(), "whisper_full start");
        let run = state.full(fp, samples);

        let stopped = bridge.stop || (bridge.hooks.should_abort)();
        if let Some(lang) = bridge.lang.take() {
            self.lang = Some(lang);
        } else if let Some(lang) = params.lang {
            self.lang = Some(lang.to_string());
        }

        if let Err(e) = run {
            if stopped {
                return Err(EngineError::Aborted);
            }
            // Decoder state is suspect after a hard failure.
            self.state = None;
            return Err(EngineError::Model(e.to_string()));
        }
        if stopped {
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    fn detected_language(&self) -> Option<String> {
        self.lang.clone()
    }

    fn reset(&mut self) {
        debug!("whisper state reset");
        self.state = None;
        self.lang = None;
    }
}

unsafe fn lossy_cstr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Fetches the last `n_new` segments (with token data) out of the
/// whisper state and forwards them through the bridge.
unsafe extern "C" fn new_segment_trampoline(
    ctx: *mut whisper_rs_sys::whisper_context,
    state: *mut whisper_rs_sys::whisper_state,
    n_new: c_int,
    user_data: *mut c_void,
) {
    let bridge = &mut *(user_data as *mut Bridge<'_, '_>);

    let n_segments = whisper_rs_sys::whisper_full_n_segments_from_state(state);
    let first = (n_segments - n_new).max(0);

    let lang_id = whisper_rs_sys::whisper_full_lang_id_from_state(state);
    let lang = lossy_cstr(whisper_rs_sys::whisper_lang_str(lang_id));
    bridge.lang = Some(lang.clone());

    let mut batch = Vec::with_capacity(n_new.max(0) as usize);
    for i in first..n_segments {
        let n_tokens = whisper_rs_sys::whisper_full_n_tokens_from_state(state, i);
        let mut tokens = Vec::with_capacity(n_tokens.max(0) as usize);
        for j in 0..n_tokens {
            let data = whisper_rs_sys::whisper_full_get_token_data_from_state(state, i, j);
            let text_ptr = whisper_rs_sys::whisper_full_get_token_text_from_state(ctx, state, i, j);
            let text = if text_ptr.is_null() {
                Vec::new()
            } else {
                CStr::from_ptr(text_ptr).to_bytes().to_vec()
            };
            tokens.push(RawToken {
                id: data.id,
                tid: data.tid,
                p: data.p,
                plog: data.plog,
                pt: data.pt,
                ptsum: data.ptsum,
                t0: data.t0,
                t1: data.t1,
                t_dtw: data.t_dtw,
                vlen: data.vlen,
                special: data.id >= bridge.eot,
                text,
            });
        }

        batch.push(RawSegment {
            t0: whisper_rs_sys::whisper_full_get_segment_t0_from_state(state, i),
            t1: whisper_rs_sys::whisper_full_get_segment_t1_from_state(state, i),
            turn_next: whisper_rs_sys::whisper_full_get_segment_speaker_turn_next_from_state(
                state, i,
            ),
            text: lossy_cstr(whisper_rs_sys::whisper_full_get_segment_text_from_state(
                state, i,
            )),
            lang: lang.clone(),
            tokens,
        });
    }

    if !(bridge.hooks.on_segments)(batch) {
        bridge.stop = true;
    }
}

/// Polled by ggml before each computation step; true aborts.
unsafe extern "C" fn abort_trampoline(user_data: *mut c_void) -> bool {
    let bridge = &mut *(user_data as *mut Bridge<'_, '_>);
    bridge.stop || (bridge.hooks.should_abort)()
}
