use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried on the wire inside an error response envelope.
///
/// These map 1:1 onto the taxonomy in the protocol design: protocol errors
/// (parse/route failures), parameter errors, state errors, and runtime
/// errors surfaced only while a replay is in flight.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMethod,
    InvalidParams,
    InvalidClient,
    InvalidTable,
    NoReplayTable,
    ReplayActive,
    ReplayAlreadyActive,
    DataSourceError,
    ReplayError,
    InternalError,
}

/// Wire representation of a router-level error.
///
/// `detail` is optional human-readable context; every code may carry one,
/// not just parameter errors, since a reader benefits from knowing which
/// table or replay was rejected and why.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(code: ErrorCode, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: Some(detail.into()),
        }
    }
}

/// Internal error type used by the router and handlers to short-circuit to
/// an [`ErrorPayload`]. Never crosses the broker or metrics boundary: those
/// subsystems never fail, they only return states (spec §7).
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("unknown method")]
    InvalidMethod,
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unknown or missing cid")]
    InvalidClient,
    #[error("table not in the advertised list: {table}")]
    InvalidTable { table: String, available: Vec<String> },
    #[error("no replay table configured")]
    NoReplayTable,
    #[error("a client login was attempted while a replay is active")]
    ReplayActive,
    #[error("a replay is already active on this connection")]
    ReplayAlreadyActive,
    #[error("data source error: {0}")]
    DataSourceError(String),
    #[error("replay error: {0}")]
    ReplayError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<&RouterError> for ErrorCode {
    fn from(err: &RouterError) -> Self {
        match err {
            RouterError::InvalidMethod => ErrorCode::InvalidMethod,
            RouterError::InvalidParams(_) => ErrorCode::InvalidParams,
            RouterError::InvalidClient => ErrorCode::InvalidClient,
            RouterError::InvalidTable { .. } => ErrorCode::InvalidTable,
            RouterError::NoReplayTable => ErrorCode::NoReplayTable,
            RouterError::ReplayActive => ErrorCode::ReplayActive,
            RouterError::ReplayAlreadyActive => ErrorCode::ReplayAlreadyActive,
            RouterError::DataSourceError(_) => ErrorCode::DataSourceError,
            RouterError::ReplayError(_) => ErrorCode::ReplayError,
            RouterError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<RouterError> for ErrorPayload {
    fn from(err: RouterError) -> Self {
        let code = ErrorCode::from(&err);
        match &err {
            RouterError::InvalidTable { available, .. } => {
                let detail = if available.is_empty() {
                    "no tables are advertised".to_string()
                } else {
                    format!("available tables: {}", available.join(", "))
                };
                ErrorPayload::with_detail(code, err.to_string(), detail)
            }
            _ => ErrorPayload::new(code, err.to_string()),
        }
    }
}
