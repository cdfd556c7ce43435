//! Audio utilities: WAV decode/encode and base64 helpers.
//!
//! Jobs arrive with a finite, pre-materialized audio buffer; there is no
//! streaming capture path. Decoding always normalizes to mono f32.

pub mod wav;

pub use wav::{decode_wav, encode_wav, PcmBuffer};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Encode arbitrary bytes with the standard base64 alphabet.
pub fn base64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode standard-alphabet base64. Returns `None` on malformed input.
pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    BASE64.decode(data).ok()
}
