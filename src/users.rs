//! Users and attendant work schedules.
//!
//! A single identity carries the role tag; attendants are attendant-role
//! users with an attached `AttendantSchedule`. Product pre-orders are
//! assigned to a seeded "counter" attendant so they flow through the same
//! slot policy as services.

use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::UserRole;

/// Username of the seeded attendant that fronts product pre-orders.
pub const PRODUCT_COUNTER_USERNAME: &str = "counter";

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub role: UserRole,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub archived: bool,
    pub created_at: NaiveDateTime,
}

/// Work schedule for one attendant. `work_days` holds day names
/// ("Monday" .. "Sunday"); times are clinic-local wall clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendantSchedule {
    pub user_id: String,
    pub work_days: Vec<String>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub phone: Option<String>,
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub full_name: &'a str,
    pub role: UserRole,
    pub phone: Option<&'a str>,
    pub email: Option<&'a str>,
}

// ─── Repository ─────────────────────────────────────────────────────────────

pub fn create_user(
    conn: &Connection,
    new: &NewUser,
    now: NaiveDateTime,
) -> Result<User, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users (id, username, full_name, role, phone, email, archived, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![id, new.username, new.full_name, new.role.as_str(), new.phone, new.email, now],
    )?;
    get_user(conn, &id)
}

pub fn get_user(conn: &Connection, id: &str) -> Result<User, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, username, full_name, role, phone, email, archived, created_at
         FROM users WHERE id = ?1",
    )?;
    match stmt.query_row(params![id], user_row) {
        Ok(row) => user_from_row(row),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(DatabaseError::NotFound {
            entity_type: "user".into(),
            id: id.into(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub fn get_user_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<User>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, username, full_name, role, phone, email, archived, created_at
         FROM users WHERE username = ?1",
    )?;
    match stmt.query_row(params![username], user_row) {
        Ok(row) => user_from_row(row).map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Active attendant-role users, ordered by name.
pub fn list_attendants(conn: &Connection) -> Result<Vec<User>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, username, full_name, role, phone, email, archived, created_at
         FROM users WHERE role = 'attendant' AND archived = 0
         ORDER BY full_name",
    )?;
    let rows = stmt.query_map([], user_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(user_from_row)
        .collect()
}

struct UserRow {
    id: String,
    username: String,
    full_name: String,
    role: String,
    phone: Option<String>,
    email: Option<String>,
    archived: bool,
    created_at: NaiveDateTime,
}

fn user_row(row: &rusqlite::Row) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        role: row.get(3)?,
        phone: row.get(4)?,
        email: row.get(5)?,
        archived: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn user_from_row(row: UserRow) -> Result<User, DatabaseError> {
    Ok(User {
        role: UserRole::from_str(&row.role)?,
        id: row.id,
        username: row.username,
        full_name: row.full_name,
        phone: row.phone,
        email: row.email,
        archived: row.archived,
        created_at: row.created_at,
    })
}

pub fn set_schedule(
    conn: &Connection,
    user_id: &str,
    work_days: &[&str],
    start_time: NaiveTime,
    end_time: NaiveTime,
    phone: Option<&str>,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let days_json = serde_json::to_string(work_days)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("work_days: {e}")))?;
    conn.execute(
        "INSERT INTO attendant_schedules (user_id, work_days, start_time, end_time, phone, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(user_id) DO UPDATE SET
             work_days = excluded.work_days,
             start_time = excluded.start_time,
             end_time = excluded.end_time,
             phone = excluded.phone",
        params![
            user_id,
            days_json,
            start_time.format("%H:%M").to_string(),
            end_time.format("%H:%M").to_string(),
            phone,
            now
        ],
    )?;
    Ok(())
}

pub fn get_schedule(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<AttendantSchedule>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, work_days, start_time, end_time, phone
         FROM attendant_schedules WHERE user_id = ?1",
    )?;
    let row = stmt.query_row(params![user_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    });
    match row {
        Ok((user_id, days_json, start, end, phone)) => {
            let work_days: Vec<String> = serde_json::from_str(&days_json)
                .map_err(|e| DatabaseError::ConstraintViolation(format!("work_days: {e}")))?;
            Ok(Some(AttendantSchedule {
                user_id,
                work_days,
                start_time: parse_time(&start)?,
                end_time: parse_time(&end)?,
                phone,
            }))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn parse_time(s: &str) -> Result<NaiveTime, DatabaseError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| DatabaseError::InvalidEnum {
            field: "time".into(),
            value: s.into(),
        })
}

/// Seed the counter attendant (handles product pre-orders, open every day).
pub fn seed_product_counter(conn: &Connection, now: NaiveDateTime) -> Result<(), DatabaseError> {
    if get_user_by_username(conn, PRODUCT_COUNTER_USERNAME)?.is_some() {
        return Ok(());
    }
    let counter = create_user(
        conn,
        &NewUser {
            username: PRODUCT_COUNTER_USERNAME,
            full_name: "Front Counter",
            role: UserRole::Attendant,
            phone: None,
            email: None,
        },
        now,
    )?;
    set_schedule(
        conn,
        &counter.id,
        &[
            "Monday",
            "Tuesday",
            "Wednesday",
            "Thursday",
            "Friday",
            "Saturday",
            "Sunday",
        ],
        NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
        NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        None,
        now,
    )?;
    Ok(())
}
