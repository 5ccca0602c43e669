//! Common error types for kpx.

use crate::protocol::ErrorCode;
use kpx_crypto::CryptoError;
use thiserror::Error;

/// Result type alias using the kpx error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for proxy operations.
///
/// Every operation returns exactly one typed success or one of these; nothing is
/// retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection refused, broken pipe, or other I/O failure. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The proxy closed the connection while a call was in flight.
    #[error("disconnected from proxy")]
    Disconnected,

    /// No reply arrived in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The key exchange was rejected or malformed. Fatal to the session.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An encrypted action was attempted before the handshake completed.
    #[error("session not established: call the key exchange first")]
    NotEstablished,

    /// A reply failed authentication. The message was discarded.
    #[error("authentication failed: message could not be decrypted")]
    Authentication,

    /// Structural JSON/base64/length violation. The whole message was discarded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The user declined the association, or it timed out.
    #[error("association denied: {0}")]
    AssociationDenied(String),

    /// No valid association exists for the current database.
    #[error("not associated: {0}")]
    NotAssociated(String),

    /// The action is valid but the database is locked or closed.
    #[error("database locked")]
    DatabaseLocked,

    /// Reply did not match the request (action, nonce, or unexpected fields).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The proxy rejected the request with an error code not covered above.
    #[error("proxy error {code}: {message}")]
    Rejected { code: ErrorCode, message: String },

    /// Local cryptographic failure (bad key material, nonce exhaustion).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Association store could not be read or written.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a malformed-message error from any displayable type.
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a handshake error from any displayable type.
    pub fn handshake(msg: impl std::fmt::Display) -> Self {
        Self::HandshakeFailed(msg.to_string())
    }

    /// Create a store error from any displayable type.
    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::Store(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Whether the session is unusable after this error and a reconnect is needed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Disconnected
                | Self::Timeout(_)
                | Self::HandshakeFailed(_)
                | Self::Crypto(_)
        )
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => Self::Authentication,
            CryptoError::InvalidNonce(_) => Self::MalformedMessage(err.to_string()),
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}
