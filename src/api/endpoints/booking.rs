//! Patient booking routes, one per catalog variant. All three run slot
//! admission inside the engine; the handlers only parse input, hold the
//! database lock for the transaction and dispatch SMS after commit.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::endpoints::{lock_db, parse_date, parse_time};
use crate::api::error::ApiError;
use crate::api::middleware::auth::require_role;
use crate::api::types::{ApiContext, AuthUser};
use crate::appointment::{self, BookingOutcome};
use crate::models::enums::UserRole;
use crate::sms;

#[derive(Debug, Deserialize)]
pub struct BookingRequest {
    /// Not used for product pre-orders; those go to the counter.
    pub attendant_id: Option<String>,
    pub date: String,
    pub time: String,
}

impl BookingRequest {
    fn attendant_id(&self) -> Result<&str, ApiError> {
        self.attendant_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::Validation("attendant_id is required".into()))
    }
}

async fn respond(ctx: &ApiContext, outcome: BookingOutcome) -> (StatusCode, Json<Value>) {
    sms::dispatch_jobs(&ctx.db, &ctx.transport, &ctx.clock, outcome.sms).await;
    (
        StatusCode::CREATED,
        Json(json!({ "appointment": outcome.appointment })),
    )
}

pub async fn book_service(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(service_id): Path<String>,
    Json(body): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let date = parse_date(&body.date)?;
    let time = parse_time(&body.time)?;
    let attendant_id = body.attendant_id()?;

    let outcome = {
        let mut conn = lock_db(&ctx)?;
        appointment::book_service(
            &mut conn,
            &ctx.clock,
            &user.id,
            &service_id,
            attendant_id,
            date,
            time,
        )?
    };
    Ok(respond(&ctx, outcome).await)
}

pub async fn book_product(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(product_id): Path<String>,
    Json(body): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let date = parse_date(&body.date)?;
    let time = parse_time(&body.time)?;

    let outcome = {
        let mut conn = lock_db(&ctx)?;
        appointment::book_product(&mut conn, &ctx.clock, &user.id, &product_id, date, time)?
    };
    Ok(respond(&ctx, outcome).await)
}

pub async fn book_package(
    State(ctx): State<ApiContext>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(package_id): Path<String>,
    Json(body): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_role(&user, &[UserRole::Patient])?;
    let date = parse_date(&body.date)?;
    let time = parse_time(&body.time)?;
    let attendant_id = body.attendant_id()?;

    let outcome = {
        let mut conn = lock_db(&ctx)?;
        appointment::book_package(
            &mut conn,
            &ctx.clock,
            &user.id,
            &package_id,
            attendant_id,
            date,
            time,
        )?
    };
    Ok(respond(&ctx, outcome).await)
}
