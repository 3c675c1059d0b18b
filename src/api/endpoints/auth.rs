//! Login: exchanges a known username for a bearer token.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::endpoints::lock_db;
use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::users;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

pub async fn login(
    State(ctx): State<ApiContext>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = {
        let conn = lock_db(&ctx)?;
        users::get_user_by_username(&conn, body.username.trim())?
    };
    let user = user.filter(|u| !u.archived).ok_or(ApiError::Unauthorized)?;

    let token = {
        let mut sessions = ctx
            .sessions
            .lock()
            .map_err(|_| ApiError::Internal("session lock poisoned".into()))?;
        sessions.issue(&user.id)
    };

    tracing::info!(username = %user.username, role = %user.role, "login");
    Ok(Json(json!({
        "token": token,
        "user": {
            "id": user.id,
            "username": user.username,
            "full_name": user.full_name,
            "role": user.role,
        }
    })))
}
