//! Silero VAD neural backend.
//!
//! Binds the v3/v4 Silero VAD ONNX model
//! (<https://github.com/snakers4/silero-vad>) to the `VadBackend`
//! seam: one window of samples in, one speech probability out. The
//! model is an LSTM; its hidden and cell state are fed back on every
//! call and zeroed by `reset`.
//!
//! The tensor contract is fixed and checked once at load instead of
//! being re-resolved per call:
//!
//! | Name     | Shape      | DType | Direction |
//! |----------|------------|-------|-----------|
//! | `input`  | `[1, N]`   | f32   | in        |
//! | `sr`     | `[1]`      | i64   | in        |
//! | `h`      | `[2,1,64]` | f32   | in        |
//! | `c`      | `[2,1,64]` | f32   | in        |
//! | `output` | `[1, 1]`   | f32   | out       |
//! | `hn`     | `[2,1,64]` | f32   | out       |
//! | `cn`     | `[2,1,64]` | f32   | out       |

use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::info;

use super::VadBackend;
use crate::error::{CoreError, Result};

/// LSTM state length: 2 layers × 1 batch × 64 units.
const STATE_LEN: usize = 2 * 64;

const IN_PCM: &str = "input";
const IN_RATE: &str = "sr";
const IN_H: &str = "h";
const IN_C: &str = "c";
const OUT_PROB: &str = "output";
const OUT_H: &str = "hn";
const OUT_C: &str = "cn";

fn onnx_err(e: impl ToString) -> CoreError {
    CoreError::OnnxSession(e.to_string())
}

pub struct SileroVad {
    session: Session,
    sample_rate: u32,
    h: Vec<f32>,
    c: Vec<f32>,
}

impl SileroVad {
    /// Load the model from `path` and verify it exposes the expected
    /// tensors. A model with a different interface (e.g. the v5 GRU
    /// export) is rejected here, not at predict time.
    pub fn new(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CoreError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(onnx_err)?
            .commit_from_file(path)
            .map_err(onnx_err)?;

        for name in [IN_PCM, IN_RATE, IN_H, IN_C] {
            if !session.inputs().iter().any(|tensor| tensor.name() == name) {
                return Err(onnx_err(format!(
                    "not a v3/v4 Silero VAD model: missing input tensor `{name}`"
                )));
            }
        }
        for name in [OUT_PROB, OUT_H, OUT_C] {
            if !session.outputs().iter().any(|tensor| tensor.name() == name) {
                return Err(onnx_err(format!(
                    "not a v3/v4 Silero VAD model: missing output tensor `{name}`"
                )));
            }
        }

        let size_mb = std::fs::metadata(path)
            .map(|m| m.len() as f64 / 1_048_576.0)
            .unwrap_or(0.0);
        info!(
            path = %path.display(),
            size_mb = format_args!("{size_mb:.2}"),
            sample_rate,
            "Silero VAD model loaded"
        );

        Ok(Self {
            session,
            sample_rate,
            h: vec![0.0; STATE_LEN],
            c: vec![0.0; STATE_LEN],
        })
    }
}

impl VadBackend for SileroVad {
    fn predict(&mut self, window: &[f32]) -> Result<f32> {
        let pcm = Array2::<f32>::from_shape_vec((1, window.len()), window.to_vec())
            .map_err(onnx_err)?;
        let rate = Array1::<i64>::from_elem(1, self.sample_rate as i64);
        let h = Array3::<f32>::from_shape_vec((2, 1, 64), self.h.clone()).map_err(onnx_err)?;
        let c = Array3::<f32>::from_shape_vec((2, 1, 64), self.c.clone()).map_err(onnx_err)?;

        let inputs: Vec<(String, SessionInputValue<'_>)> = vec![
            (
                IN_PCM.to_string(),
                Value::from_array(pcm).map_err(onnx_err)?.into(),
            ),
            (
                IN_RATE.to_string(),
                Value::from_array(rate).map_err(onnx_err)?.into(),
            ),
            (
                IN_H.to_string(),
                Value::from_array(h).map_err(onnx_err)?.into(),
            ),
            (
                IN_C.to_string(),
                Value::from_array(c).map_err(onnx_err)?.into(),
            ),
        ];

        let outputs = self.session.run(inputs).map_err(onnx_err)?;

        let prob = {
            let tensor = outputs
                .get(OUT_PROB)
                .ok_or_else(|| onnx_err("run produced no probability tensor"))?;
            let (_, data) = tensor.try_extract_tensor::<f32>().map_err(onnx_err)?;
            data.first().copied().unwrap_or(0.0)
        };

        // Carry the recurrent state into the next window.
        for (name, state) in [(OUT_H, &mut self.h), (OUT_C, &mut self.c)] {
            let tensor = outputs
                .get(name)
                .ok_or_else(|| onnx_err(format!("run produced no `{name}` tensor")))?;
            let (_, data) = tensor.try_extract_tensor::<f32>().map_err(onnx_err)?;
            if data.len() != STATE_LEN {
                return Err(onnx_err(format!(
                    "`{name}` has {} values, expected {STATE_LEN}",
                    data.len()
                )));
            }
            state.clear();
            state.extend_from_slice(data);
        }

        Ok(prob)
    }

    fn reset(&mut self) {
        self.h.iter_mut().for_each(|v| *v = 0.0);
        self.c.iter_mut().for_each(|v| *v = 0.0);
    }
}
