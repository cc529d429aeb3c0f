use crate::request::RequestError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lockstep_common::LockstepError;
use serde_json::json;
use thiserror::Error;

/// Error codes for failures after validation
pub mod codes {
    pub const GROUP_TIMEOUT: &str = "group_timeout";
    pub const GROUP_UNAVAILABLE: &str = "group_unavailable";
    pub const RANK_DIVERGENCE: &str = "rank_divergence";
    pub const GENERATION_FAILED: &str = "generation_failed";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{}", .0.message)]
    BadRequest(#[from] RequestError),

    #[error(transparent)]
    Lockstep(#[from] LockstepError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.classify().0
    }

    pub fn code(&self) -> &'static str {
        self.classify().1
    }

    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.code),
            ApiError::Lockstep(e) => match e {
                LockstepError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, codes::GROUP_TIMEOUT),
                LockstepError::GroupUnavailable(_)
                | LockstepError::WorkerUnavailable(_)
                | LockstepError::Protocol(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, codes::GROUP_UNAVAILABLE)
                }
                LockstepError::Divergence(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, codes::RANK_DIVERGENCE)
                }
                LockstepError::Model(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, codes::GENERATION_FAILED)
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL_ERROR),
            },
        }
    }
}

/// Convert ApiError into HTTP response
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Chat request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        use StatusCode as S;

        let cases = [
            (LockstepError::timeout("slow"), S::GATEWAY_TIMEOUT, codes::GROUP_TIMEOUT),
            (LockstepError::protocol("desync"), S::SERVICE_UNAVAILABLE, codes::GROUP_UNAVAILABLE),
            (
                LockstepError::group_unavailable("failed"),
                S::SERVICE_UNAVAILABLE,
                codes::GROUP_UNAVAILABLE,
            ),
            (LockstepError::divergence("ranks"), S::INTERNAL_SERVER_ERROR, codes::RANK_DIVERGENCE),
            (LockstepError::model("oom"), S::INTERNAL_SERVER_ERROR, codes::GENERATION_FAILED),
            (LockstepError::internal("bug"), S::INTERNAL_SERVER_ERROR, codes::INTERNAL_ERROR),
        ];

        for (err, status, code) in cases {
            let err = ApiError::from(err);
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_request_error_keeps_its_code() {
        let err = ApiError::from(crate::request::validate_messages(None).unwrap_err());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_message_list");
        assert_eq!(err.to_string(), "`messages` is required");
    }
}
