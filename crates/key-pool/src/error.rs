//! Error types for pool operations

/// Expected, recoverable outcomes of pool operations.
///
/// None of these indicate a fault in the pool; they are part of the normal
/// result space and are reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no available keys left")]
    PoolEmpty,

    #[error("key not found: {0}")]
    Unknown(String),

    #[error("key is not leased: {0}")]
    NotLeased(String),

    #[error("key expired: {0}")]
    Expired(String),
}

impl Error {
    /// Short label used for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Error::PoolEmpty => "pool_empty",
            Error::Unknown(_) => "unknown",
            Error::NotLeased(_) => "not_leased",
            Error::Expired(_) => "expired",
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
