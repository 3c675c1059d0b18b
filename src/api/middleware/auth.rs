//! Bearer token authentication. Resolves `Authorization: Bearer <token>`
//! through the session store, loads the user row and injects [`AuthUser`]
//! into request extensions for downstream handlers.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, AuthUser};
use crate::models::enums::UserRole;
use crate::users;

pub async fn require_auth(req: Request<axum::body::Body>, next: Next) -> Response {
    match require_auth_inner(req, next).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn require_auth_inner(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?
        .to_string();

    let user_id = {
        let sessions = ctx
            .sessions
            .lock()
            .map_err(|_| ApiError::Internal("session lock poisoned".into()))?;
        sessions
            .resolve(&token)
            .map(str::to_string)
            .ok_or(ApiError::Unauthorized)?
    };

    let user = {
        let conn = ctx
            .db
            .lock()
            .map_err(|_| ApiError::Internal("database lock poisoned".into()))?;
        match users::get_user(&conn, &user_id) {
            Ok(user) => user,
            // Stale session for a deleted user.
            Err(crate::db::DatabaseError::NotFound { .. }) => return Err(ApiError::Unauthorized),
            Err(e) => return Err(e.into()),
        }
    };
    if user.archived {
        return Err(ApiError::Unauthorized);
    }

    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

/// Role gate used by handlers on top of authentication.
pub fn require_role(user: &crate::users::User, allowed: &[UserRole]) -> Result<(), ApiError> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}
