//! API error handling
//!
//! Maps engine errors onto HTTP statuses with a stable JSON body of the form
//! `{ "error": "...", "code": "..." }` so operator tooling can branch on the
//! code without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tessera_collections::CollectionsError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] CollectionsError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e.code() {
                "invalid_state_transition" | "concurrent_modification" | "already_processed" => {
                    StatusCode::CONFLICT
                }
                "incomplete_data" => StatusCode::UNPROCESSABLE_ENTITY,
                "not_found" => StatusCode::NOT_FOUND,
                "external_dependency_failure" => StatusCode::BAD_GATEWAY,
                "webhook_signature_invalid" => StatusCode::UNAUTHORIZED,
                "webhook_event_not_supported" => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Engine(e) => e.code(),
            ApiError::Unauthorized => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal detail stays in the logs, not the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let conflict = ApiError::Engine(CollectionsError::InvalidStateTransition {
            state: "paid".into(),
            action: "escalate".into(),
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let incomplete = ApiError::Engine(CollectionsError::IncompleteData {
            missing: vec!["address".into()],
        });
        assert_eq!(incomplete.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let missing = ApiError::Engine(CollectionsError::CaseNotFound(Uuid::new_v4()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let external =
            ApiError::Engine(CollectionsError::ExternalDependency("mail timeout".into()));
        assert_eq!(external.status(), StatusCode::BAD_GATEWAY);

        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
