//! # Error Handling
//!
//! Error types for the Orca transfer core, grouped by domain:
//!
//! - **Input**: bad caller input (missing file, zero chunk size). Fail fast,
//!   nothing is published.
//! - **Bus**: broker connectivity and publish/subscribe failures. Fatal for
//!   the sender, recovered by reconnection on the receiver.
//! - **Payload**: malformed inbound messages. Logged and discarded, never
//!   fatal.
//! - **Integrity**: digest mismatches. Recovered through the retry flow.
//! - **Persistence**: state/data file I/O. The affected chunk is simply not
//!   marked received, so a later retry re-delivers it.

use thiserror::Error;

/// Result type alias for Orca core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Orca transfer core.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Input Errors
    // ========================================================================
    /// The file to send does not exist or is not a regular file.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Chunk size must be at least one byte.
    #[error("Invalid chunk size: {0} (must be >= 1)")]
    InvalidChunkSize(usize),

    /// QoS outside the 0/1/2 range.
    #[error("Invalid QoS level: {0} (must be 0, 1 or 2)")]
    InvalidQos(u8),

    // ========================================================================
    // Bus Errors
    // ========================================================================
    /// The broker session was not established within the connect timeout.
    #[error("Timed out waiting for broker session at {0}")]
    ConnectTimeout(String),

    /// Operation requires an established broker session.
    #[error("Not connected to the broker.")]
    NotConnected,

    /// The underlying client rejected a publish.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The underlying client rejected a subscribe.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    // ========================================================================
    // Payload Errors
    // ========================================================================
    /// Inbound payload was not valid UTF-8 JSON or is missing fields.
    #[error("Malformed payload: {0}")]
    PayloadDecode(String),

    /// Manifest failed schema validation.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    // ========================================================================
    // Integrity Errors
    // ========================================================================
    /// A chunk's digest disagrees with its manifest entry.
    #[error("Chunk {index} digest mismatch: expected {expected}, got {actual}")]
    ChunkDigestMismatch {
        /// Zero-based chunk index.
        index: u32,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },

    /// The reassembled file's digest disagrees with the manifest.
    #[error("File digest mismatch: expected {expected}, got {actual}")]
    FileDigestMismatch {
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest of the reconstructed file.
        actual: String,
    },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// Failed to read or write transfer state or data on disk.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Whether this error is recoverable within the core (logged and worked
    /// around) as opposed to surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PayloadDecode(_)
                | Error::InvalidManifest(_)
                | Error::ChunkDigestMismatch { .. }
                | Error::FileDigestMismatch { .. }
                | Error::Persistence(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_fatal() {
        assert!(!Error::FileNotFound("x".into()).is_recoverable());
        assert!(!Error::InvalidChunkSize(0).is_recoverable());
        assert!(!Error::ConnectTimeout("localhost:1883".into()).is_recoverable());
    }

    #[test]
    fn test_protocol_errors_are_recoverable() {
        assert!(Error::PayloadDecode("not json".into()).is_recoverable());
        assert!(Error::Persistence("disk full".into()).is_recoverable());
        assert!(Error::ChunkDigestMismatch {
            index: 3,
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidChunkSize(0);
        assert_eq!(err.to_string(), "Invalid chunk size: 0 (must be >= 1)");

        let err = Error::InvalidQos(7);
        assert!(err.to_string().contains("must be 0, 1 or 2"));
    }
}
