//! Detached JWS error types and conversions
//!
//! Every failure the signing/verification core can produce is one variant of
//! [`JwsDetachedError`]. A signature that simply does not match is *not* an
//! error at the engine level; it only becomes [`JwsDetachedError::InvalidSignature`]
//! once a caller decides a mismatch must be rejected.

use std::io;

use thiserror::Error;

use crate::buffering::BufferLimitError;

/// Detached JWS errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwsDetachedError {
    /// Signature header absent on a request that requires verification
    #[error("Signature header '{header_name}' not found")]
    HeaderNotFound {
        /// Name of the header that was looked up
        header_name: String,
    },

    /// Token is not three dot-separated segments, or a segment does not decode
    #[error("Malformed detached token: {reason}")]
    MalformedToken {
        /// Detailed reason for the parsing failure
        reason: String,
    },

    /// The `alg` header claim is missing or has no registered capability
    #[error("Unsupported signature algorithm: {}", algorithm.as_deref().unwrap_or("<missing>"))]
    UnsupportedAlgorithm {
        /// The claimed algorithm, `None` when the claim is absent or not a string
        algorithm: Option<String>,
    },

    /// Structurally valid token whose signature does not match the payload
    #[error("Invalid signature")]
    InvalidSignature,

    /// Request body exceeded the configured buffering limit
    #[error("Read buffer limit of {limit} bytes exceeded")]
    ReadBufferLimitExceeded {
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// Response body exceeded the configured buffering limit
    #[error("Write buffer limit of {limit} bytes exceeded")]
    WriteBufferLimitExceeded {
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// Unexpected I/O failure while reading a payload
    #[error("Read error: {reason}")]
    ReadError {
        /// Detailed reason for the read failure
        reason: String,
    },

    /// Key material or signing primitive failure
    #[error("Cryptographic error: {reason}")]
    CryptographicError {
        /// Detailed reason for the cryptographic failure
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    ConfigurationError {
        /// Detailed reason for the configuration error
        reason: String,
    },

    /// I/O failure outside of payload reading (temp files, response output)
    #[error("I/O error: {reason}")]
    IoError {
        /// Detailed reason for the I/O failure
        reason: String,
    },
}

impl JwsDetachedError {
    /// Shorthand for a [`JwsDetachedError::MalformedToken`]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }

    /// Check if the error is a verification rejection caused by the peer
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::HeaderNotFound { .. }
                | Self::MalformedToken { .. }
                | Self::UnsupportedAlgorithm { .. }
                | Self::InvalidSignature
        )
    }

    /// Check if a configured buffer ceiling was hit
    pub fn is_buffer_limit(&self) -> bool {
        matches!(
            self,
            Self::ReadBufferLimitExceeded { .. } | Self::WriteBufferLimitExceeded { .. }
        )
    }

    /// Map an I/O failure raised while reading a payload.
    ///
    /// Buffer ceilings travel inside [`io::Error`] and are recovered here.
    pub fn from_read(err: io::Error) -> Self {
        match BufferLimitError::from_io(&err) {
            Some(limit) => limit.into(),
            None => Self::ReadError {
                reason: err.to_string(),
            },
        }
    }
}

impl From<BufferLimitError> for JwsDetachedError {
    fn from(err: BufferLimitError) -> Self {
        match err {
            BufferLimitError::Read { limit } => Self::ReadBufferLimitExceeded { limit },
            BufferLimitError::Write { limit } => Self::WriteBufferLimitExceeded { limit },
        }
    }
}

impl From<io::Error> for JwsDetachedError {
    fn from(err: io::Error) -> Self {
        match BufferLimitError::from_io(&err) {
            Some(limit) => limit.into(),
            None => Self::IoError {
                reason: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for JwsDetachedError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedToken {
            reason: format!("invalid header JSON: {err}"),
        }
    }
}

impl From<base64::DecodeError> for JwsDetachedError {
    fn from(err: base64::DecodeError) -> Self {
        Self::MalformedToken {
            reason: format!("invalid base64url: {err}"),
        }
    }
}

impl From<signature::Error> for JwsDetachedError {
    fn from(err: signature::Error) -> Self {
        Self::CryptographicError {
            reason: format!("signing failed: {err}"),
        }
    }
}
