//! Shared plumbing for the handler families: typed handler errors, param
//! extraction, and the domain-error to wire-code mappings.

use serde_json::{json, Value};

use crate::announcements::AnnouncementError;
use crate::auth::AuthError;
use crate::courses::CourseError;
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::polls::VoteError;
use crate::roster::RosterError;
use crate::store::{DocStore, StoreError};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: Value,
    ) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Lets handler code run store transactions with `?` while keeping its own
/// error codes for the domain-level failures.
impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> HandlerErr {
        store_err(e)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {key}")))
}

pub fn get_trimmed_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let value = get_required_str(params, key)?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(bad_params(format!("{key} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(bad_params(format!("{key} must be a boolean"))),
    }
}

/// The store handle for the selected workspace. Cloning is cheap; the clone
/// shares the underlying connection.
pub fn require_store(state: &AppState) -> Result<DocStore, HandlerErr> {
    state
        .store
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Admin gate: methods carrying a `token` param pass through here.
pub fn require_admin(state: &AppState, params: &Value) -> Result<DocStore, HandlerErr> {
    let store = require_store(state)?;
    let token = params.get("token").and_then(Value::as_str).unwrap_or("");
    state
        .auth
        .require(&store, token)
        .map_err(auth_err)?;
    Ok(store)
}

pub fn store_err(e: StoreError) -> HandlerErr {
    match e {
        StoreError::NotFound { .. } => HandlerErr::new("not_found", e.to_string()),
        StoreError::Conflict => HandlerErr::new(
            "conflict",
            "the document kept changing while the operation retried",
        ),
        StoreError::ReadAfterWrite => HandlerErr::new("db_tx_failed", e.to_string()),
        StoreError::BadBody { .. } => HandlerErr::new("db_doc_invalid", e.to_string()),
        StoreError::Encode(_) => HandlerErr::new("db_encode_failed", e.to_string()),
        StoreError::Db(_) => HandlerErr::new("db_query_failed", e.to_string()),
    }
}

pub fn vote_err(e: VoteError) -> HandlerErr {
    match e {
        VoteError::PollNotFound(_) => HandlerErr::new("not_found", e.to_string()),
        VoteError::InvalidOption { .. } => HandlerErr::new("invalid_option", e.to_string()),
        VoteError::PermissionDenied(message) => HandlerErr::new("permission_denied", message),
        VoteError::Store(inner) => store_err(inner),
    }
}

pub fn roster_err(e: RosterError) -> HandlerErr {
    match e {
        RosterError::Validation(message) => HandlerErr::new("validation_failed", message),
        RosterError::Store(inner) => store_err(inner),
    }
}

pub fn course_err(e: CourseError) -> HandlerErr {
    match e {
        CourseError::Validation(message) => HandlerErr::new("validation_failed", message),
        CourseError::NotFound(message) => HandlerErr::new("not_found", message),
        CourseError::Store(inner) => store_err(inner),
    }
}

pub fn announcement_err(e: AnnouncementError) -> HandlerErr {
    match e {
        AnnouncementError::Validation(message) => HandlerErr::new("validation_failed", message),
        AnnouncementError::Store(inner) => store_err(inner),
    }
}

pub fn auth_err(e: AuthError) -> HandlerErr {
    match e {
        AuthError::RateLimited { retry_after_secs } => HandlerErr::with_details(
            "rate_limited",
            e.to_string(),
            json!({ "retryAfterSecs": retry_after_secs }),
        ),
        AuthError::InvalidKey => HandlerErr::new("permission_denied", "invalid admin key"),
        AuthError::InvalidToken => {
            HandlerErr::new("permission_denied", "invalid or expired session token")
        }
        AuthError::Store(inner) => store_err(inner),
    }
}
