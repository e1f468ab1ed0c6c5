//! Error types for bootcheck.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for bootcheck operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootcheck operations.
///
/// Every variant except [`Error::Io`] is fatal to a protocol run. There are no
/// retries anywhere in the driver.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (process pipes, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The emulator binary is missing or could not be started.
    #[error("Environment error: {0}")]
    Environment(String),

    /// An expected token did not arrive before its deadline.
    #[error("Timeout waiting for {token:?} after {secs:.1}s", secs = .timeout.as_secs_f64())]
    Timeout {
        /// Token that was expected.
        token: String,
        /// Deadline of the failed wait.
        timeout: Duration,
        /// Text received during the wait.
        captured: String,
    },

    /// The target closed its output before an expected token arrived.
    #[error("UART closed while waiting for {token:?}")]
    StreamClosed {
        /// Token that was expected.
        token: String,
        /// Text received during the wait.
        captured: String,
    },

    /// A forbidden token arrived where only `expected` was valid.
    #[error("Protocol violation: {forbidden:?} seen while waiting for {expected:?}")]
    ProtocolViolation {
        /// Token that was expected.
        expected: String,
        /// Forbidden token that was observed.
        forbidden: String,
        /// Text received during the wait.
        captured: String,
    },

    /// Writing to the target failed.
    #[error("Send failed{}", .index.map(|i| format!(" at byte {i}")).unwrap_or_default())]
    Transmission {
        /// Index of the byte that failed, when known.
        index: Option<usize>,
        /// Underlying write error.
        #[source]
        source: io::Error,
    },

    /// Firmware artifact could not be loaded.
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// The embedding application requested the run to stop.
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Text captured from the UART while the failing wait was running.
    pub fn captured(&self) -> Option<&str> {
        match self {
            Self::Timeout { captured, .. }
            | Self::StreamClosed { captured, .. }
            | Self::ProtocolViolation { captured, .. } => Some(captured),
            _ => None,
        }
    }

    /// Captured text truncated to at most `limit` characters.
    pub fn captured_preview(&self, limit: usize) -> Option<String> {
        self.captured()
            .map(|text| text.chars().take(limit).collect())
    }

    /// Whether this error is a protocol violation rather than a plain timeout.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_preview_truncates() {
        let err = Error::Timeout {
            token: "BOOT?".into(),
            timeout: Duration::from_secs(3),
            captured: "0123456789".into(),
        };
        assert_eq!(err.captured_preview(4).as_deref(), Some("0123"));
        assert_eq!(err.captured_preview(50).as_deref(), Some("0123456789"));
    }

    #[test]
    fn test_transmission_message_includes_index() {
        let err = Error::Transmission {
            index: Some(17),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "closed"),
        };
        assert_eq!(err.to_string(), "Send failed at byte 17");
        assert!(err.captured().is_none());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout {
            token: "READY".into(),
            timeout: Duration::from_millis(5000),
            captured: String::new(),
        };
        assert_eq!(err.to_string(), "Timeout waiting for \"READY\" after 5.0s");
        assert!(!err.is_protocol_violation());
    }
}
