use thiserror::Error;

/// Stratum error types.
///
/// The serving layer maps these onto the distribution error schema; only
/// that schema ever leaves the process.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested repository/tag is not served by any rule.
    #[error("not found")]
    NotFound,

    /// A blob path resolves nowhere in the content-addressed store.
    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    /// Wrong HTTP method for the distribution surface.
    #[error("unsupported method: {0}")]
    Unsupported(String),

    /// Failure talking to a remote registry.
    #[error("upstream {reference}: {message}")]
    Upstream {
        reference: String,
        message: String,
        /// HTTP status when the registry answered; `None` on transport failure.
        status: Option<u16>,
    },

    /// A computed digest disagrees with the claimed digest.
    #[error("digest mismatch: computed {actual}, expected {expected}")]
    DigestMismatch { expected: String, actual: String },

    /// Byte count after a copy disagrees with the declared size.
    #[error("size mismatch: copied {actual}, expected {expected}")]
    SizeMismatch { expected: i64, actual: i64 },

    /// Pattern parse error, unknown media type, zero-size layer, bad config.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An index build whose platform filter left no children.
    #[error("no valid children after platform filtering")]
    NoValidChildren,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is an integrity failure (digest or size mismatch).
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::DigestMismatch { .. } | Error::SizeMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for stratum operations.
pub type Result<T> = std::result::Result<T, Error>;
