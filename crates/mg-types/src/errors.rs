//! Gateway-wide error taxonomy.
//!
//! Every fallible path in the workspace returns [`AppResult`]. The HTTP layer
//! maps variants onto status codes and the JSON-RPC layer onto error codes;
//! the variants here carry just enough structure for those mappings.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed inbound request (bad JSON, missing fields, bad params).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Credentials missing where the endpoint requires them.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials presented but not valid.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Endpoint, namespace, server, or capability lookup came up empty.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request rejected by a rate-limit window.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Backend process/connection is gone or could not be established.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Domain error reported by a backend server, passed through unchanged.
    #[error("backend error {code}: {message}")]
    Backend {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Definition store failure (lookup or write).
    #[error("store error: {0}")]
    Store(String),

    /// Invariant violation inside the gateway itself.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AppResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = GatewayError::NotFound("endpoint 'docs'".to_string());
        assert_eq!(err.to_string(), "not found: endpoint 'docs'");

        let err = GatewayError::RateLimited {
            retry_after_secs: 42,
        };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn io_errors_convert() {
        fn read() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }
        assert!(matches!(read(), Err(GatewayError::Io(_))));
    }
}
