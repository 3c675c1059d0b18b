//! HTTP error surface. Every failure renders as
//! `{"error": {"code": "...", "message": "..."}}`; internal faults are
//! logged server-side and never leak detail to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::appointment::EngineError;
use crate::db::DatabaseError;

#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid bearer token.
    Unauthorized,
    /// Authenticated but the role does not permit this route.
    Forbidden,
    NotFound(String),
    /// Malformed or unacceptable input.
    Validation(String),
    /// Slot admission refused the booking.
    Rejected(String),
    /// The appointment or request is not in a state that allows the action.
    InvalidState(String),
    /// Unexpected fault; detail stays in the log.
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InvalidState(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation",
            ApiError::Rejected(_) => "rejected",
            ApiError::InvalidState(_) => "invalid_state",
            ApiError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "Authentication required".into(),
            ApiError::Forbidden => "You do not have access to this resource".into(),
            ApiError::NotFound(msg)
            | ApiError::Validation(msg)
            | ApiError::Rejected(msg)
            | ApiError::InvalidState(msg) => msg.clone(),
            ApiError::Internal(_) => "Internal server error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!("internal API error: {detail}");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Rejected(reason) => ApiError::Rejected(reason.to_string()),
            EngineError::Validation(msg) => ApiError::Validation(msg),
            EngineError::InvalidState { .. } | EngineError::InvalidRequestState { .. } => {
                ApiError::InvalidState(e.to_string())
            }
            EngineError::Database(db) => db.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::AppointmentStatus;
    use crate::slot_policy::RejectReason;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn admission_rejection_maps_to_rejected() {
        let err: ApiError = EngineError::from(RejectReason::FullyBooked).into();
        let (status, json) = body_json(err).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["code"], "rejected");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("fully booked"));
    }

    #[tokio::test]
    async fn invalid_state_maps_to_conflict() {
        let err: ApiError = EngineError::InvalidState {
            action: "confirm",
            state: AppointmentStatus::Cancelled,
        }
        .into();
        let (status, json) = body_json(err).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn missing_entity_maps_to_not_found() {
        let err: ApiError = DatabaseError::NotFound {
            entity_type: "appointment".into(),
            id: "missing".into(),
        }
        .into();
        let (status, json) = body_json(err).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn internal_detail_is_hidden() {
        let err = ApiError::Internal("connection pool exploded".into());
        let (status, json) = body_json(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["message"], "Internal server error");
    }
}
