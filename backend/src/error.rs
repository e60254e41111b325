//! Standardized error responses for the ledgerflow API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::workflows::{StoreError, WorkflowError};

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "NOT_FOUND", "BAD_REQUEST")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    InternalError(String),
    DatabaseError(String),
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Message shown to the client. Server-side details are logged, not returned.
    pub fn message(&self) -> String {
        match self {
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::BadRequest(msg) => msg.clone(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = ApiError::new(self.error_code(), self.message());
        (status, Json(error)).into_response()
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::StepNotFound(id) => Self::NotFound(format!("Workflow step {}", id)),
            WorkflowError::InstanceNotFound(id) => Self::NotFound(format!("Workflow instance {}", id)),
            WorkflowError::NotAnApproval(_) => Self::BadRequest(err.to_string()),
            WorkflowError::Store(StoreError::Unavailable(msg)) => Self::DatabaseError(msg),
            WorkflowError::Store(e) => Self::DatabaseError(e.to_string()),
            WorkflowError::Catalog(e) => Self::InternalError(e.to_string()),
            WorkflowError::Service(e) => Self::ExternalServiceError {
                service: "workflow collaborator".to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_workflow_error_mapping() {
        let missing: AppError = WorkflowError::StepNotFound(Uuid::new_v4()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let wrong_kind: AppError = WorkflowError::NotAnApproval(Uuid::new_v4()).into();
        assert_eq!(wrong_kind.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(wrong_kind.error_code(), "BAD_REQUEST");

        let down: AppError = WorkflowError::Store(StoreError::Unavailable("refused".to_string())).into();
        assert_eq!(down.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(down.message(), "A database error occurred");
    }
}
