//! Remote collaborators of the pipeline
//!
//! The seller portal client pulls reviews; the ERP client answers order,
//! variant and catalogue lookups. Both sit behind async traits so the
//! orchestrator and linker can be driven by in-process fakes.

use reqwest::StatusCode;
use thiserror::Error;

pub mod erp;
pub mod seller;

pub use erp::{ErpApi, ErpLineItem, ErpOrder, ErpProduct, ErpVariant, SapoClient};
pub use seller::{RatingsPage, RatingsQuery, SellerApi, SellerSession, ShopeeClient};

/// Failure of a remote call, classified by how the caller should react.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Network failure, timeout, 5xx, 408 or 429
    #[error("transient remote error: {message}")]
    Transient { message: String },

    /// Non-zero `code` in the seller API envelope
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// 4xx other than auth failures, or a body that does not match the contract
    #[error("permanent remote error: {message}")]
    Permanent { message: String },

    /// Credentials were rejected; fresh ones must be supplied externally
    #[error("credentials rejected: {message}")]
    AuthExpired { message: String },

    /// The remote answered 404 for a single-record lookup
    #[error("not found: {message}")]
    NotFound { message: String },
}

impl ClientError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn auth_expired<S: Into<String>>(message: S) -> Self {
        Self::AuthExpired {
            message: message.into(),
        }
    }

    /// Whether the per-page retry wrapper should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Remote { .. })
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Remote { .. } => "remote",
            Self::Permanent { .. } => "permanent",
            Self::AuthExpired { .. } => "auth_expired",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// Maps a non-success HTTP status onto the error taxonomy.
    pub(crate) fn from_status(status: StatusCode, context: &str) -> Self {
        let message = format!("{context} failed: {status}");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::AuthExpired { message },
            StatusCode::NOT_FOUND => Self::NotFound { message },
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                Self::Transient { message }
            }
            s if s.is_server_error() => Self::Transient { message },
            _ => Self::Permanent { message },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::permanent(format!("malformed response body: {err}"))
        } else if let Some(status) = err.status() {
            ClientError::from_status(status, "request")
        } else if err.is_builder() {
            ClientError::permanent(format!("invalid request: {err}"))
        } else {
            // timeouts, connect and body-read failures
            ClientError::transient(err.to_string())
        }
    }
}

/// Renders a JSON scalar as the string form used for id comparisons.
///
/// The seller portal and the ERP disagree on whether ids are numbers or
/// strings; `1234` and `"1234"` compare equal after this.
pub(crate) fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses a JSON scalar id into an integer, accepting numeric strings.
pub(crate) fn id_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert!(matches!(
            ClientError::from_status(StatusCode::UNAUTHORIZED, "x"),
            ClientError::AuthExpired { .. }
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::FORBIDDEN, "x"),
            ClientError::AuthExpired { .. }
        ));
        assert!(ClientError::from_status(StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(ClientError::from_status(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
        assert!(matches!(
            ClientError::from_status(StatusCode::REQUEST_TIMEOUT, "x"),
            ClientError::Transient { .. }
        ));
        assert!(!ClientError::from_status(StatusCode::BAD_REQUEST, "x").is_retryable());
        assert!(matches!(
            ClientError::from_status(StatusCode::NOT_FOUND, "x"),
            ClientError::NotFound { .. }
        ));
    }

    #[test]
    fn ids_compare_as_strings() {
        assert_eq!(id_string(&json!(1234)), Some("1234".to_string()));
        assert_eq!(id_string(&json!(" 1234 ")), Some("1234".to_string()));
        assert_eq!(id_string(&json!(null)), None);
        assert_eq!(id_i64(&json!("42")), Some(42));
        assert_eq!(id_i64(&json!(true)), None);
    }
}
