//! Base64 JSON header encoding used by `X-Payment` and `Payment-Response`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as b64, URL_SAFE_NO_PAD};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Failure to decode a base64 JSON header.
#[derive(Debug, thiserror::Error)]
pub enum HeaderDecodeError {
    /// Not base64.
    #[error("header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Not the expected JSON document.
    #[error("header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes `value` to JSON and encodes it with standard base64.
///
/// # Errors
///
/// Returns the JSON error if `value` cannot be serialized.
pub fn encode_header<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    Ok(b64.encode(serde_json::to_vec(value)?))
}

/// Decodes a base64 JSON header. Standard and URL-safe alphabets are accepted.
///
/// # Errors
///
/// Returns [`HeaderDecodeError`] when either layer is malformed.
pub fn decode_header<T: DeserializeOwned>(header: &str) -> Result<T, HeaderDecodeError> {
    let header = header.trim();
    let bytes = match b64.decode(header) {
        Ok(bytes) => bytes,
        Err(err) => URL_SAFE_NO_PAD
            .decode(header.trim_end_matches('='))
            .map_err(|_| err)?,
    };
    Ok(serde_json::from_slice(&bytes)?)
}
