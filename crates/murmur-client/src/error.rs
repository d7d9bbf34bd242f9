use murmur_shared::error::CryptoError;
use murmur_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the engine and its ports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No valid session. Credentials are cleared.
    #[error("Not logged in: {0}")]
    Auth(String),

    /// Encryption failed. Decryption never produces this.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Timeout or network failure; retried with backoff.
    #[error("Network error: {0}")]
    TransientIo(String),

    /// The message store refused a write, or the recipient has no key.
    #[error("Rejected: {0}")]
    RemoteRejection(String),

    /// Local durable storage failure.
    #[error("Local storage error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientIo(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        EngineError::TransientIo("request timed out".into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
