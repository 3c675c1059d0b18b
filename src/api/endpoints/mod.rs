//! Endpoint handlers, grouped by audience. Handlers run domain operations
//! while holding the database lock, then release it before dispatching any
//! queued SMS.

pub mod admin;
pub mod auth;
pub mod booking;
pub mod leave;
pub mod notifications;
pub mod patient;

use std::sync::MutexGuard;

use chrono::{NaiveDate, NaiveTime};
use rusqlite::Connection;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

pub(crate) fn lock_db<'a>(ctx: &'a ApiContext) -> Result<MutexGuard<'a, Connection>, ApiError> {
    ctx.db
        .lock()
        .map_err(|_| ApiError::Internal("database lock poisoned".into()))
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation(format!("Invalid date: {s} (expected YYYY-MM-DD)")))
}

pub(crate) fn parse_time(s: &str) -> Result<NaiveTime, ApiError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| ApiError::Validation(format!("Invalid time: {s} (expected HH:MM)")))
}

/// Query-string `?limit=` with a sane default and ceiling.
pub(crate) fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, 500)
}
