/// Top-level Trellis error type.
///
/// All fallible operations in `trellis-core` return [`Result<T, SyncError>`](Result).
/// Each variant wraps a domain-specific error enum so callers can match on the
/// source, and [`SyncError::is_transient`] decides whether a retry is worthwhile.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// Error from the graph store layer (`SQLite` operations, schema).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Error talking to an upstream issue tracker or source-control API.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A fetched record is missing its identity key or a required field.
    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl SyncError {
    /// Whether the failure is worth retrying.
    ///
    /// Network, timeout, rate-limit and 5xx upstream failures are transient, as
    /// are rejected store writes. Malformed records, configuration problems,
    /// client errors and decode failures are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Upstream(e) => e.is_transient(),
            Self::Config(_) | Self::Malformed(_) => false,
        }
    }
}

/// Errors from the SQLite-backed graph store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A referenced node was not found in the store.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// JSON serialization/deserialization of metadata failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Sqlite(_))
    }
}

/// Errors from upstream HTTP APIs.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    /// Connection-level failure (DNS, TLS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded its per-call timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The API refused the call because of rate limiting.
    #[error("Rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        /// Seconds the server asked us to wait, if it said.
        retry_after_secs: Option<u64>,
    },

    /// The API returned a non-success HTTP status.
    #[error("API error (HTTP {status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Credentials were rejected.
    #[error("API auth failed: {0}")]
    Auth(String),

    /// Response body could not be decoded into the expected shape.
    #[error("Response parse error: {0}")]
    Parse(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Auth(_) | Self::Parse(_) => false,
        }
    }

    /// Classify a `reqwest` transport error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Errors in Trellis configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// A pattern table entry is not a valid regular expression.
    #[error("Invalid pattern `{pattern}`: {message}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// Compiler message from the regex engine.
        message: String,
    },

    /// A credential environment variable named by the config is unset.
    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(String),
}

/// Convenience alias for `Result<T, SyncError>`.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_classification() {
        assert!(UpstreamError::Network("reset".into()).is_transient());
        assert!(UpstreamError::Timeout("30s".into()).is_transient());
        assert!(
            UpstreamError::RateLimited {
                retry_after_secs: Some(5)
            }
            .is_transient()
        );
        assert!(
            UpstreamError::Api {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !UpstreamError::Api {
                status: 404,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!UpstreamError::Auth("bad token".into()).is_transient());
        assert!(!UpstreamError::Parse("eof".into()).is_transient());
    }

    #[test]
    fn malformed_and_config_are_permanent() {
        assert!(!SyncError::Malformed("missing key".into()).is_transient());
        assert!(!SyncError::Config(ConfigError::Invalid("x".into())).is_transient());
    }

    #[test]
    fn store_write_failures_are_transient() {
        let err = SyncError::Store(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        assert!(err.is_transient());
        let err = SyncError::Store(StoreError::NodeNotFound("PROJ-1".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn display_includes_source() {
        let err = SyncError::from(UpstreamError::Api {
            status: 502,
            body: "bad gateway".into(),
        });
        assert_eq!(
            err.to_string(),
            "Upstream error: API error (HTTP 502): bad gateway"
        );
    }
}
