//! Error types for value parsing in chandler-types.

use thiserror::Error;

/// Errors that can occur when interpreting valve protocol values.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in chandler-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A passcode was not exactly four ASCII digits.
    #[error("Invalid passcode: expected 4 digits, got {0:?}")]
    InvalidPasscode(String),

    /// A model name did not match any known controller board.
    #[error("Unknown valve model: {0}")]
    UnknownModel(String),

    /// A byte or field held a value outside its defined range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using chandler-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
