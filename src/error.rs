//! Unified error model for the access manager.
//! Every fallible operation in the crate returns `AccessResult<T>`; the variants mirror the
//! failure kinds callers are expected to react to, and carry a stable code plus an HTTP
//! status so a frontend can surface them without matching on variants.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("policy already exists: {0}")]
    DuplicatePolicy(String),
    #[error("no policies matched {0}")]
    NothingRemoved(String),
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("path '{0}' not found in the tree")]
    PathNotFound(String),
    #[error("no resources match '{0}'")]
    NoMatch(String),
    #[error("action '{0}' is not supported by this endpoint")]
    UnsupportedAction(String),
    #[error("unsupported endpoint flavor: {0}")]
    UnsupportedFlavor(String),
    #[error("subject {subject} may not {action} '{resource}' on endpoint {endpoint}")]
    Forbidden { subject: Uuid, endpoint: Uuid, resource: String, action: String },
    #[error("invalid resource pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type AccessResult<T> = Result<T, AccessError>;

impl AccessError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        AccessError::NotFound { kind, id: id.to_string() }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        AccessError::AlreadyExists { kind, id: id.to_string() }
    }

    pub fn backend<E: std::fmt::Display>(err: E) -> Self { AccessError::BackendUnavailable(err.to_string()) }

    pub fn code_str(&self) -> &'static str {
        match self {
            AccessError::DuplicatePolicy(_) => "duplicate_policy",
            AccessError::NothingRemoved(_) => "nothing_removed",
            AccessError::AlreadyExists { .. } => "already_exists",
            AccessError::NotFound { .. } => "not_found",
            AccessError::PathNotFound(_) => "path_not_found",
            AccessError::NoMatch(_) => "no_match",
            AccessError::UnsupportedAction(_) => "unsupported_action",
            AccessError::UnsupportedFlavor(_) => "unsupported_flavor",
            AccessError::Forbidden { .. } => "forbidden",
            AccessError::InvalidPattern { .. } => "invalid_pattern",
            AccessError::InvalidConfig(_) => "invalid_config",
            AccessError::BackendUnavailable(_) => "backend_unavailable",
            AccessError::Io(_) => "io",
            AccessError::Json(_) => "json",
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AccessError::DuplicatePolicy(_) | AccessError::AlreadyExists { .. } => 409,
            AccessError::NotFound { .. } | AccessError::PathNotFound(_) | AccessError::NoMatch(_) => 404,
            AccessError::NothingRemoved(_) => 422,
            AccessError::UnsupportedAction(_)
            | AccessError::UnsupportedFlavor(_)
            | AccessError::InvalidPattern { .. } => 400,
            AccessError::Forbidden { .. } => 403,
            AccessError::BackendUnavailable(_) => 503,
            AccessError::InvalidConfig(_) | AccessError::Io(_) | AccessError::Json(_) => 500,
        }
    }

    /// True only for backend connectivity failures.
    pub fn is_retryable(&self) -> bool { matches!(self, AccessError::BackendUnavailable(_)) }
}
