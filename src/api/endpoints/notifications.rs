//! Notification feed, available to every authenticated role. Owners see
//! the broadcast rows in addition to rows addressed to them.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::api::endpoints::lock_db;
use crate::api::error::ApiError;
use crate::api::types::{ApiContext, AuthUser};
use crate::notifications;

pub async fn feed(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let feed = {
        let conn = lock_db(&ctx)?;
        notifications::unread_feed(&conn, &user)?
    };
    Ok(Json(json!({
        "notifications": feed.notifications,
        "unread_count": feed.unread_count,
    })))
}

pub async fn mark_read(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    {
        let conn = lock_db(&ctx)?;
        notifications::mark_read(&conn, &user, &id)?;
    }
    Ok(Json(json!({ "read": true })))
}

pub async fn mark_all_read(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let marked = {
        let conn = lock_db(&ctx)?;
        notifications::mark_all_read(&conn, &user)?
    };
    Ok(Json(json!({ "marked": marked })))
}
