use thiserror::Error;

/// Errors returned by cache backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// An in-process lock was poisoned by a panicking writer.
    #[error("cache lock poisoned: {0}")]
    Poisoned(String),
    /// The backend could not be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache error: {0}")]
    Other(String),
}
