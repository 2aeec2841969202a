//! # Error Handling
//!
//! Errors surfaced by the feedback store, the orchestrator and the job
//! control plane. Remote failures keep their [`ClientError`] classification so
//! callers can decide between retrying, skipping a page or failing the job.

use sea_orm::DbErr;
use thiserror::Error;

use crate::clients::ClientError;
use crate::cursor::CursorParseError;
use crate::shops::RegistryError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Remote(#[from] ClientError),

    /// A review payload that cannot be stored (missing `comment_id`, bad field types)
    #[error("malformed review payload: {details}")]
    DataShape { details: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("sync job {job_id} not found")]
    JobNotFound { job_id: i64 },

    #[error("sync job {job_id} is {status}; cannot {action}")]
    InvalidJobState {
        job_id: i64,
        status: String,
        action: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Cursor(#[from] CursorParseError),

    /// Operator interrupt observed at a suspension point
    #[error("sync cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl PipelineError {
    pub fn data_shape<S: Into<String>>(details: S) -> Self {
        Self::DataShape {
            details: details.into(),
        }
    }

    /// Whether this error ends the whole job rather than a single item or page.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Remote(err) => matches!(err, ClientError::AuthExpired { .. }),
            Self::DataShape { .. } => false,
            _ => true,
        }
    }
}

/// Whether a database error is a unique-constraint violation (Postgres or SQLite).
pub(crate) fn is_unique_violation(error: &DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_expired_is_fatal_but_data_shape_is_not() {
        assert!(PipelineError::from(ClientError::auth_expired("401")).is_fatal());
        assert!(!PipelineError::from(ClientError::transient("timeout")).is_fatal());
        assert!(!PipelineError::data_shape("missing comment_id").is_fatal());
        assert!(PipelineError::Database(DbErr::Custom("boom".into())).is_fatal());
    }

    #[test]
    fn invalid_state_message_names_action() {
        let err = PipelineError::InvalidJobState {
            job_id: 7,
            status: "running".to_string(),
            action: "resume",
        };
        assert_eq!(err.to_string(), "sync job 7 is running; cannot resume");
    }

    #[test]
    fn non_sqlx_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&DbErr::RecordNotFound("x".into())));
    }
}
