//! Error types for the transform cache.

use thiserror::Error;

/// Transform cache error type.
///
/// The serving layer matches on [`CacheError::code`] rather than on
/// variants, so the string tags are part of the stable surface.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Source file does not exist
    #[error("source file not found: {0}")]
    NotFound(String),

    /// Legacy transform requested for a format it does not accept
    #[error("no transform available for {0}")]
    NoTransform(String),

    /// Module transform requested for a format it does not accept
    #[error("unsupported module format: {0}")]
    UnsupportedFormat(String),

    /// Worker rejection or a dependency resolving outside the public directory
    #[error("transform failed: {0}")]
    Transform(String),

    /// Resolver failure, passed through unwrapped
    #[error("failed to resolve {specifier}: {message}")]
    Resolve { specifier: String, message: String },

    /// Filesystem error other than the collapsed not-found cases
    #[error("io error: {0}")]
    Io(String),
}

impl CacheError {
    /// Stable error code tag, or `None` for passthrough errors.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            CacheError::NotFound(_) => Some("not-found"),
            CacheError::NoTransform(_) => Some("no-transform"),
            CacheError::UnsupportedFormat(_) => Some("unsupported-format"),
            CacheError::Transform(_) => Some("transform-error"),
            CacheError::Resolve { .. } | CacheError::Io(_) => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
