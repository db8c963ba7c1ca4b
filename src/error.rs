//! Error handling module for hostseed
//!
//! Provides the library's error taxonomy using thiserror. The variants mirror
//! how a provisioning run can fail: the session could not be opened, a command
//! returned a real nonzero status, a command was killed by a signal, or a
//! downloaded artifact failed its checksum.

use thiserror::Error;

/// Main error type for the provisioning engine
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The remote session could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// The channel to the remote machine broke while a command was in flight
    #[error("Channel error: {0}")]
    Channel(String),

    /// A command ran and returned a real nonzero exit code
    #[error("Command `{command}` failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A command was terminated by a signal before it could report a real code
    #[error("Command `{command}` was interrupted by {signal}")]
    ChannelInterrupted { command: String, signal: String },

    /// A checksum did not match its expected value (corrupt or tampered data)
    #[error("Integrity failure for {subject}: expected sha256 {expected}, got {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },

    /// The remote machine is not a supported OS release or architecture
    #[error("Unsupported host: {0}")]
    UnsupportedHost(String),

    /// Validation errors (user input, config values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// File transfer errors (scp)
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Step state machine transition errors
    #[error("Step transition error: {0}")]
    StepTransition(String),

    /// IO errors (local files, spawning ssh)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

// Convenient error constructors
impl ProvisionError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create an integrity error
    pub fn integrity(
        subject: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            subject: subject.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an unsupported host error
    pub fn unsupported_host(msg: impl Into<String>) -> Self {
        Self::UnsupportedHost(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transfer error
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    /// Create a step transition error
    pub fn step_transition(msg: impl Into<String>) -> Self {
        Self::StepTransition(msg.into())
    }

    /// Returns true for checksum mismatches, which must never be retried
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    /// Returns true if a remote command was killed by a signal
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::ChannelInterrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::validation("artifact name is empty");
        assert_eq!(err.to_string(), "Validation error: artifact name is empty");

        let err = ProvisionError::CommandFailed {
            command: "apt-get update".to_string(),
            code: 100,
            stderr: "E: could not lock".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command `apt-get update` failed with exit code 100: E: could not lock"
        );
    }

    #[test]
    fn test_integrity_display_names_both_digests() {
        let err = ProvisionError::integrity("pack tarball", "aa", "bb");
        let msg = err.to_string();
        assert!(msg.contains("pack tarball"));
        assert!(msg.contains("expected sha256 aa"));
        assert!(msg.contains("got bb"));
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "ssh not found");
        let err: ProvisionError = io_err.into();
        assert!(matches!(err, ProvisionError::Io(_)));
    }

    #[test]
    fn test_interruption_predicate() {
        let err = ProvisionError::ChannelInterrupted {
            command: "test -e '/etc/x'".to_string(),
            signal: "SIGKILL".to_string(),
        };
        assert!(err.is_interruption());
        assert!(!ProvisionError::channel("broken pipe").is_interruption());
    }
}
