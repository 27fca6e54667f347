//! Abort protocol codec
//!
//! A host-requested early termination has to leave the sandbox through the only
//! channel every boundary supports: a plain error message. The envelope is a fixed
//! sentinel followed by the JSON encoding of the abort payload.

use serde_json::Value;

/// Prefix marking an error message as an abort envelope
pub const ABORT_SENTINEL: &str = "__ERGON_ABORT__:";

/// An error message carried the sentinel but its payload was not valid JSON
#[derive(Debug, thiserror::Error)]
#[error("Malformed abort envelope: {0}")]
pub struct AbortEnvelopeError(#[from] serde_json::Error);

/// Encode an abort payload as an error message
pub fn encode(value: &Value) -> String {
    // Serializing a `Value` cannot fail: keys are always strings
    let payload = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    format!("{ABORT_SENTINEL}{payload}")
}

/// Check whether a message carries the sentinel
pub fn is_abort(message: &str) -> bool {
    message.starts_with(ABORT_SENTINEL)
}

/// Decode an error message.
///
/// Returns `Ok(None)` for ordinary error messages, `Ok(Some(value))` for a well-formed
/// envelope and an error when the sentinel is present but the payload does not parse.
pub fn decode(message: &str) -> Result<Option<Value>, AbortEnvelopeError> {
    match message.strip_prefix(ABORT_SENTINEL) {
        Some(payload) => Ok(Some(serde_json::from_str(payload)?)),
        None => Ok(None),
    }
}
