//! Error types for chandler-core.
//!
//! None of these errors are fatal to the engine. [`crate::ConnectionSession::poll`]
//! turns every error returned while talking to a valve into a
//! [`crate::PollOutcome`] and logs it; the next poll is gated by the
//! connection cooldown. A panic inside a poll is not caught here: polls run
//! as their own tasks, so it ends that task only.
//!
//! | Error Type | Outcome |
//! |------------|---------|
//! | [`Error::NotConnectable`] | Skipped quietly, device out of range |
//! | [`Error::Timeout`] / [`Error::ConnectionFailed`] | Logged, cooldown armed, retried |
//! | [`Error::CharacteristicNotFound`] | Logged, poll failed |
//! | [`Error::NoResponse`] | Request treated as unanswered, previous state kept |
//! | [`Error::AuthenticationFailed`] | Lockout latched for the attempted passcode, Dashboard skipped |
//! | [`Error::Cancelled`] | Poll failed during shutdown |
//! | [`Error::InvalidConfig`] | Returned by [`crate::ManagerConfig::validate`] |

use std::time::Duration;

use thiserror::Error;

use chandler_types::{ParseError, RequestCommand};

/// Errors that can occur while talking to a valve.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is present.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// No connectable handle is known for the address.
    #[error("Device {0} is not connectable")]
    NotConnectable(String),

    /// Operation attempted while not connected to the valve.
    #[error("Not connected to device")]
    NotConnected,

    /// Opening the GATT connection failed.
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// The valve address.
        address: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// No usable request characteristic was found.
    #[error("No writable request characteristic found (searched {service_count} services)")]
    CharacteristicNotFound {
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Write operation failed.
    #[error("Write failed to characteristic {uuid}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A response failed structural validation.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The valve did not answer a request in time.
    #[error("No response to {request} request")]
    NoResponse {
        /// The request that went unanswered.
        request: RequestCommand,
    },

    /// All challenge/response rounds were rejected.
    #[error("Authentication failed after {attempts} attempts")]
    AuthenticationFailed {
        /// Number of rounds attempted.
        attempts: u32,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure for an address.
    pub fn connection_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a write failure for a characteristic.
    pub fn write_failed(uuid: impl ToString, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            uuid: uuid.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// True for failures to establish the connection itself.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::Timeout { .. } | Error::Bluetooth(_)
        )
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidPasscode(value) => {
                Error::InvalidConfig(format!("invalid passcode {value:?}"))
            }
            other => Error::InvalidData(other.to_string()),
        }
    }
}

/// Result type alias using chandler-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("connect", Duration::from_secs(20));
        assert_eq!(
            err.to_string(),
            "Operation 'connect' timed out after 20s"
        );
        assert!(err.is_connect_failure());
    }

    #[test]
    fn test_no_response_display() {
        let err = Error::NoResponse {
            request: RequestCommand::Dashboard,
        };
        assert_eq!(err.to_string(), "No response to Dashboard request");
        assert!(!err.is_connect_failure());
    }

    #[test]
    fn test_connection_failed_display() {
        let err = Error::connection_failed("AA:BB:CC:DD:EE:FF", "le-connection-abort-by-local");
        assert_eq!(
            err.to_string(),
            "Connection to AA:BB:CC:DD:EE:FF failed: le-connection-abort-by-local"
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = ParseError::InvalidPasscode("12".into()).into();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err: Error = ParseError::InvalidValue("bad".into()).into();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn test_authentication_failed_display() {
        let err = Error::AuthenticationFailed { attempts: 4 };
        assert_eq!(err.to_string(), "Authentication failed after 4 attempts");
    }
}
