//! Error types for the decoder

use thiserror::Error;

use crate::codes;

/// A command that could not be turned into a task descriptor
///
/// Decode failures are terminal: the message is acknowledged with a single
/// error reply and never retried.
#[derive(Debug, Error)]
#[error("failed to decode command: {reason}")]
pub struct DecodeError {
    /// Why decoding failed
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Return code reported for every decode failure
    pub fn code(&self) -> i32 {
        codes::ARG_FILE_FAIL
    }
}
