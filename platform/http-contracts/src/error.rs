use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error categories shared by every service, with their HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    InvalidEventEnvelope,
    UnsupportedEvent,
    SchemaNotFound,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    IdempotencyKeyRequired,
    IdempotencyConflict,
    IdempotencyInFlight,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::InvalidInput
            | ErrorKind::InvalidEventEnvelope
            | ErrorKind::UnsupportedEvent
            | ErrorKind::SchemaNotFound
            | ErrorKind::IdempotencyKeyRequired => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict
            | ErrorKind::IdempotencyConflict
            | ErrorKind::IdempotencyInFlight => 409,
            ErrorKind::Transient => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Machine-readable `error.code` value.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidEventEnvelope => "invalid_event_envelope",
            ErrorKind::UnsupportedEvent => "unsupported_event",
            ErrorKind::SchemaNotFound => "schema_not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::IdempotencyKeyRequired => "idempotency_key_required",
            ErrorKind::IdempotencyConflict => "idempotency_conflict",
            ErrorKind::IdempotencyInFlight => "idempotency_in_flight",
            ErrorKind::Transient => "transient_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// Error returned by handlers and middleware; renders as the error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: "error".to_string(),
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.message.clone(),
                request_id: self.request_id.clone(),
            },
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// `{"status":"error","error":{...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorEnvelope {
    pub status: String,
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_map_to_status_and_code() {
        assert_eq!(ErrorKind::IdempotencyKeyRequired.status(), 400);
        assert_eq!(ErrorKind::IdempotencyConflict.status(), 409);
        assert_eq!(ErrorKind::IdempotencyInFlight.code(), "idempotency_in_flight");
        assert_eq!(ErrorKind::Transient.status(), 503);
        assert_eq!(ErrorKind::Transient.code(), "transient_error");
        assert_eq!(ErrorKind::Internal.status(), 500);
    }

    #[test]
    fn test_envelope_shape() {
        let err = ApiError::not_found("thing t-1 not found").with_request_id("req-1");
        let value = serde_json::to_value(err.to_envelope()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "status": "error",
                "error": {
                    "code": "not_found",
                    "message": "thing t-1 not found",
                    "request_id": "req-1"
                }
            })
        );
    }
}
