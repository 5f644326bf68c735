//! Byte-encoding helpers exposed to the script runtime.
//!
//! `atob`/`btoa` follow the web platform: strings are "binary strings" where
//! each char carries one byte (U+0000..=U+00FF).

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use thiserror::Error;

/// Decoder that accepts input with or without padding.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("The string to be encoded contains characters outside of the Latin1 range.")]
    OutsideLatin1,

    #[error("invalid base64: {0}")]
    InvalidBase64(String),
}

/// `TextEncoder.encode`.
pub fn encode_utf8(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// `TextEncoder.encode` over the UTF-16 code units a script string is made
/// of. Lone surrogates become U+FFFD.
pub fn encode_utf16_as_utf8(units: &[u16]) -> Vec<u8> {
    String::from_utf16_lossy(units).into_bytes()
}

pub fn base64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Strict decode of well-formed base64 (padding optional).
pub fn base64_decode(encoded: impl AsRef<[u8]>) -> Result<Vec<u8>, EncodingError> {
    LENIENT
        .decode(encoded)
        .map_err(|e| EncodingError::InvalidBase64(e.to_string()))
}

/// `atob`: characters outside the base64 alphabet are skipped; undecodable
/// input yields an empty string.
pub fn atob(encoded: &str) -> String {
    atob_bytes(encoded.as_bytes())
        .into_iter()
        .map(char::from)
        .collect()
}

/// [`atob`] as raw bytes, one per char of the binary string.
pub fn atob_bytes(encoded: &[u8]) -> Vec<u8> {
    let filtered: Vec<u8> = encoded
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        .collect();

    LENIENT.decode(filtered).unwrap_or_default()
}

/// `btoa`: every char must fit in one byte.
pub fn btoa(binary: &str) -> Result<String, EncodingError> {
    let bytes = binary
        .chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| EncodingError::OutsideLatin1))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(STANDARD.encode(bytes))
}

/// [`btoa`] over UTF-16 code units.
pub fn btoa_utf16(units: &[u16]) -> Result<String, EncodingError> {
    let bytes = units
        .iter()
        .map(|unit| u8::try_from(*unit).map_err(|_| EncodingError::OutsideLatin1))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(STANDARD.encode(bytes))
}
