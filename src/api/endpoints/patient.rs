//! Patient self-service: own appointments, cancellation and reschedule
//! requests, unavailability responses and feedback.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::endpoints::{lock_db, parse_date, parse_time};
use crate::api::error::ApiError;
use crate::api::middleware::auth::require_role;
use crate::api::types::{ApiContext, AuthUser};
use crate::appointment;
use crate::feedback;
use crate::leave;
use crate::models::enums::{PatientChoice, UserRole};
use crate::requests;

pub async fn my_appointments(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let appointments = {
        let conn = lock_db(&ctx)?;
        appointment::list_for_patient(&conn, &user.id)?
    };
    Ok(Json(json!({ "appointments": appointments })))
}

#[derive(Debug, Deserialize)]
pub struct CancellationBody {
    pub reason: String,
}

pub async fn request_cancellation(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
    Json(body): Json<CancellationBody>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let request = {
        let mut conn = lock_db(&ctx)?;
        requests::request_cancellation(
            &mut conn,
            &ctx.clock,
            &user,
            &appointment_id,
            &body.reason,
        )?
    };
    Ok(Json(json!({ "request": request })))
}

#[derive(Debug, Deserialize)]
pub struct RescheduleBody {
    pub new_date: String,
    pub new_time: String,
    pub reason: Option<String>,
}

pub async fn request_reschedule(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
    Json(body): Json<RescheduleBody>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let new_date = parse_date(&body.new_date)?;
    let new_time = parse_time(&body.new_time)?;
    let request = {
        let mut conn = lock_db(&ctx)?;
        requests::request_reschedule(
            &mut conn,
            &ctx.clock,
            &user,
            &appointment_id,
            new_date,
            new_time,
            body.reason.as_deref(),
        )?
    };
    Ok(Json(json!({ "request": request })))
}

pub async fn pending_unavailability(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let notices = {
        let conn = lock_db(&ctx)?;
        leave::pending_unavailability_for_patient(&conn, &user.id)?
    };
    Ok(Json(json!({ "unavailability": notices })))
}

#[derive(Debug, Deserialize)]
pub struct UnavailabilityChoice {
    pub choice: PatientChoice,
}

/// The path id is the appointment; the handler locates that appointment's
/// pending unavailability notice.
pub async fn resolve_unavailability(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
    Json(body): Json<UnavailabilityChoice>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let resolved = {
        let mut conn = lock_db(&ctx)?;
        let notice = leave::pending_unavailability_for_patient(&conn, &user.id)?
            .into_iter()
            .find(|n| n.appointment_id == appointment_id)
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "Entity not found: unavailability_request with id {appointment_id}"
                ))
            })?;
        leave::resolve_unavailability(&mut conn, &ctx.clock, &user, &notice.id, body.choice)?
    };
    Ok(Json(json!({ "unavailability": resolved })))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub service_rating: i64,
    pub attendant_rating: Option<i64>,
    pub comment: Option<String>,
}

pub async fn submit_feedback(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(appointment_id): Path<String>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<Value>, ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let feedback = {
        let mut conn = lock_db(&ctx)?;
        feedback::submit_feedback(
            &mut conn,
            &ctx.clock,
            &user,
            &appointment_id,
            body.service_rating,
            body.attendant_rating,
            body.comment.as_deref(),
        )?
    };
    Ok(Json(json!({ "feedback": feedback })))
}
