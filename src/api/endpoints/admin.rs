//! Staff and owner desk: appointment lifecycle actions, request review,
//! calendar management, and the audit feeds.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::endpoints::{clamp_limit, lock_db, parse_date};
use crate::api::error::ApiError;
use crate::api::middleware::auth::require_role;
use crate::api::types::{ApiContext, AuthUser};
use crate::appointment::{self, TreatmentDetails};
use crate::calendar;
use crate::history;
use crate::models::enums::UserRole;
use crate::requests;
use crate::sms;

const DESK: &[UserRole] = &[UserRole::Staff, UserRole::Owner];

// ─── Appointment lifecycle ──────────────────────────────────────────────────

pub async fn confirm(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let (appointment, jobs) = {
        let mut conn = lock_db(&ctx)?;
        let jobs = appointment::confirm(&mut conn, &ctx.clock, &appointment_id, &user)?;
        (appointment::get_appointment(&conn, &appointment_id)?, jobs)
    };
    sms::dispatch_jobs(&ctx.db, &ctx.transport, &ctx.clock, jobs).await;
    Ok(Json(json!({ "appointment": appointment })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteBody {
    pub treatment: Option<TreatmentDetails>,
}

pub async fn complete(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
    body: Option<Json<CompleteBody>>,
) -> Result<Json<Value>, ApiError> {
    // Attendants close out their own treatments at the chair.
    require_role(
        &user,
        &[UserRole::Staff, UserRole::Owner, UserRole::Attendant],
    )?;
    let treatment = body.and_then(|Json(b)| b.treatment);
    let appointment = {
        let mut conn = lock_db(&ctx)?;
        appointment::complete(
            &mut conn,
            &ctx.clock,
            &appointment_id,
            &user,
            treatment.as_ref(),
        )?;
        appointment::get_appointment(&conn, &appointment_id)?
    };
    Ok(Json(json!({ "appointment": appointment })))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

pub async fn cancel(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let (appointment, jobs) = {
        let mut conn = lock_db(&ctx)?;
        let jobs = appointment::cancel(&mut conn, &ctx.clock, &appointment_id, &user, &body.reason)?;
        (appointment::get_appointment(&conn, &appointment_id)?, jobs)
    };
    sms::dispatch_jobs(&ctx.db, &ctx.transport, &ctx.clock, jobs).await;
    Ok(Json(json!({ "appointment": appointment })))
}

// ─── Request review ─────────────────────────────────────────────────────────

pub async fn list_cancellation_requests(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let requests = {
        let conn = lock_db(&ctx)?;
        requests::list_cancellations(&conn)?
    };
    Ok(Json(json!({ "requests": requests })))
}

pub async fn approve_cancellation(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let (request, jobs) = {
        let mut conn = lock_db(&ctx)?;
        let jobs = requests::approve_cancellation(&mut conn, &ctx.clock, &request_id, &user)?;
        (requests::get_cancellation(&conn, &request_id)?, jobs)
    };
    sms::dispatch_jobs(&ctx.db, &ctx.transport, &ctx.clock, jobs).await;
    Ok(Json(json!({ "request": request })))
}

pub async fn reject_cancellation(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let request = {
        let mut conn = lock_db(&ctx)?;
        requests::reject_cancellation(&mut conn, &ctx.clock, &request_id, &user)?;
        requests::get_cancellation(&conn, &request_id)?
    };
    Ok(Json(json!({ "request": request })))
}

pub async fn list_reschedule_requests(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let requests = {
        let conn = lock_db(&ctx)?;
        requests::list_reschedules(&conn)?
    };
    Ok(Json(json!({ "requests": requests })))
}

pub async fn approve_reschedule(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let (request, jobs) = {
        let mut conn = lock_db(&ctx)?;
        let jobs = requests::approve_reschedule(&mut conn, &ctx.clock, &request_id, &user)?;
        (requests::get_reschedule(&conn, &request_id)?, jobs)
    };
    sms::dispatch_jobs(&ctx.db, &ctx.transport, &ctx.clock, jobs).await;
    Ok(Json(json!({ "request": request })))
}

pub async fn reject_reschedule(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let request = {
        let mut conn = lock_db(&ctx)?;
        requests::reject_reschedule(&mut conn, &ctx.clock, &request_id, &user)?;
        requests::get_reschedule(&conn, &request_id)?
    };
    Ok(Json(json!({ "request": request })))
}

// ─── Calendar ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClosedDayBody {
    pub date: String,
    pub reason: Option<String>,
}

pub async fn add_closed_day(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(body): Json<ClosedDayBody>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let date = parse_date(&body.date)?;
    let closed = {
        let conn = lock_db(&ctx)?;
        calendar::add_closed_day(&conn, date, body.reason.as_deref())?;
        calendar::closed_day(&conn, date)?
    };
    Ok(Json(json!({ "closed_day": closed })))
}

pub async fn remove_closed_day(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(date): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let date = parse_date(&date)?;
    {
        let conn = lock_db(&ctx)?;
        calendar::remove_closed_day(&conn, date)?;
    }
    Ok(Json(json!({ "removed": true })))
}

// ─── Audit feeds ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<i64>,
    /// Entity kind filter for the history feed ("appointment", "product", ...).
    pub kind: Option<String>,
}

pub async fn history_feed(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let limit = clamp_limit(query.limit);
    let entries = {
        let conn = lock_db(&ctx)?;
        match query.kind.as_deref() {
            Some(kind) => history::recent_for_kind(&conn, kind, limit)?,
            None => history::recent(&conn, limit)?,
        }
    };
    Ok(Json(json!({ "history": entries })))
}

pub async fn sms_log(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, DESK)?;
    let messages = {
        let conn = lock_db(&ctx)?;
        sms::list_messages(&conn, clamp_limit(query.limit))?
    };
    Ok(Json(json!({ "messages": messages })))
}
