//! Error types for data parsing in bluedroid-types.

use thiserror::Error;

/// Errors that can occur when decoding sensor payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in bluedroid-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload was shorter than the encoding requires.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Bytes required by the encoding.
        expected: usize,
        /// Bytes actually received.
        actual: usize,
    },
}

/// Result type alias using bluedroid-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
