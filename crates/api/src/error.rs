//! Error handling for API endpoints

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// API error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad Request", Some(msg)),
            ApiError::Internal(msg) => {
                tracing::error!("Internal server error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

/// Convert sqlx errors to ApiError
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(format!("Database error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            error: "Bad Request".to_string(),
            details: Some("body must be a non-empty list".to_string()),
        };

        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("Bad Request"));
        assert!(json.contains("non-empty list"));
    }

    #[test]
    fn test_error_response_without_details() {
        let error = ErrorResponse {
            error: "Internal Server Error".to_string(),
            details: None,
        };

        let json = serde_json::to_string(&error).unwrap();
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let api_err: ApiError = sqlx::Error::RowNotFound.into();
        match api_err {
            ApiError::Internal(msg) => assert!(msg.contains("Database error")),
            ApiError::BadRequest(_) => panic!("Expected Internal error"),
        }
    }
}
