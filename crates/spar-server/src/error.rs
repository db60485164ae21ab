//! HTTP mapping for pipeline errors
//!
//! Every handler returns [`ApiError`] on failure; the response body always
//! carries the stable wire code plus the user-facing message, so clients
//! branch on `error` and display `message` untouched.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use spar_core::{ErrorClass, SparError};

/// Wire shape of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Boundary wrapper turning a pipeline error into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SparError);

impl From<SparError> for ApiError {
    fn from(error: SparError) -> Self {
        Self(error)
    }
}

/// Status per error class, with the handful of codes that deviate. Only a
/// missing path resource is a 404; a dangling reference inside a request
/// body stays a 400.
pub fn status_for(error: &SparError) -> StatusCode {
    match error.class() {
        ErrorClass::Input => match error.code() {
            "conversation_not_found" | "turn_not_found" => StatusCode::NOT_FOUND,
            "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
            "turn_conflict" => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        },
        ErrorClass::Provider => StatusCode::BAD_GATEWAY,
        ErrorClass::Systemic => match error.code() {
            "job_not_found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.code(),
                message: self.0.user_message(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_resources_are_404() {
        assert_eq!(
            status_for(&SparError::ConversationNotFound("c1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SparError::TurnNotFound("t1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SparError::JobNotFound("j1".into())),
            StatusCode::NOT_FOUND
        );
        // A bad reference in the body is the caller's mistake, not a missing
        // resource.
        assert_eq!(
            status_for(&SparError::ReplyTurnNotFound("t1".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_input_errors_are_client_statuses() {
        assert_eq!(status_for(&SparError::AudioEmpty), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&SparError::ConversationNotActive("c1".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SparError::RateLimited("10/min".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&SparError::TurnConflict("index 3".into())),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_provider_and_systemic_statuses() {
        assert_eq!(status_for(&SparError::AsrSilence), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&SparError::TtsFailed("provider down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&SparError::Store("lost".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_response_body_carries_code_and_message() {
        let response = ApiError(SparError::AsrSilence).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
