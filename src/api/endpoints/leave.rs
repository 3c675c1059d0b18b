//! Attendant leave requests and the owner's review queue. Approval fans
//! out unavailability notices to every patient booked on the leave date.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::endpoints::{lock_db, parse_date};
use crate::api::error::ApiError;
use crate::api::middleware::auth::require_role;
use crate::api::types::{ApiContext, AuthUser};
use crate::leave;
use crate::models::enums::UserRole;
use crate::sms;

#[derive(Debug, Deserialize)]
pub struct LeaveBody {
    pub leave_date: String,
    pub reason: String,
}

pub async fn request_leave(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(body): Json<LeaveBody>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Attendant])?;
    let leave_date = parse_date(&body.leave_date)?;
    let request = {
        let mut conn = lock_db(&ctx)?;
        leave::request_leave(&mut conn, &ctx.clock, &user, leave_date, &body.reason)?
    };
    Ok(Json(json!({ "request": request })))
}

pub async fn my_leave(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Attendant])?;
    let requests = {
        let conn = lock_db(&ctx)?;
        leave::list_leave_for_attendant(&conn, &user.id)?
    };
    Ok(Json(json!({ "requests": requests })))
}

pub async fn pending_leave(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Owner])?;
    let requests = {
        let conn = lock_db(&ctx)?;
        leave::list_pending_leave(&conn)?
    };
    Ok(Json(json!({ "requests": requests })))
}

pub async fn approve_leave(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Owner])?;
    let outcome = {
        let mut conn = lock_db(&ctx)?;
        leave::approve_leave(&mut conn, &ctx.clock, &request_id, &user)?
    };
    let patients_notified = outcome.patients_notified;
    let request = outcome.request.clone();
    sms::dispatch_jobs(&ctx.db, &ctx.transport, &ctx.clock, outcome.sms).await;
    Ok(Json(json!({
        "request": request,
        "patients_notified": patients_notified,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectLeaveBody {
    pub reason: Option<String>,
}

pub async fn reject_leave(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(request_id): Path<String>,
    body: Option<Json<RejectLeaveBody>>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Owner])?;
    let reason = body.and_then(|Json(b)| b.reason);
    let request = {
        let mut conn = lock_db(&ctx)?;
        leave::reject_leave(&mut conn, &ctx.clock, &request_id, &user, reason.as_deref())?;
        leave::get_leave(&conn, &request_id)?
    };
    Ok(Json(json!({ "request": request })))
}
