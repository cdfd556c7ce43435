//! WAV ↔ PCM conversion on top of `hound`.
//!
//! Decoding accepts 16-bit integer and 32-bit float WAV at any channel
//! count; multi-channel audio is downmixed by averaging. Encoding always
//! writes 32-bit float mono, so `decode(encode(pcm))` is bit-exact on
//! normalized mono input.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{CoreError, Result};

/// Decoded PCM audio: mono f32 samples at a known rate.
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count of the source file (before downmix).
    pub channels: u16,
}

impl PcmBuffer {
    /// Duration of the decoded audio in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Decode a WAV byte buffer into mono f32 PCM.
///
/// # Errors
/// `CoreError::BadInput` for unreadable headers, unsupported sample
/// formats, or zero-sample payloads.
pub fn decode_wav(data: &[u8]) -> Result<PcmBuffer> {
    let mut reader = WavReader::new(Cursor::new(data))
        .map_err(|e| CoreError::BadInput(format!("unreadable WAV: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| CoreError::BadInput(format!("bad WAV payload: {e}")))?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| CoreError::BadInput(format!("bad WAV payload: {e}")))?,
        (format, bits) => {
            return Err(CoreError::BadInput(format!(
                "unsupported WAV format: {format:?} {bits}-bit"
            )));
        }
    };

    let channels = spec.channels.max(1);
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    if samples.is_empty() {
        return Err(CoreError::BadInput("WAV contains no samples".into()));
    }

    Ok(PcmBuffer {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Encode mono f32 PCM as a 32-bit float WAV byte buffer.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut out = Cursor::new(Vec::new());
    {
        // Writing to an in-memory cursor cannot fail.
        let mut writer = WavWriter::new(&mut out, spec).expect("WAV header write");
        for &sample in samples {
            writer.write_sample(sample).expect("WAV sample write");
        }
        writer.finalize().expect("WAV finalize");
    }
    out.into_inner()
}
