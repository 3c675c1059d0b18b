//! Clinic calendar authority: wall-clock time, store hours per weekday,
//! and the closed-day set. All times are clinic-local; no zone conversion.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;
use crate::users::parse_time;

// ─── Clock ──────────────────────────────────────────────────────────────────

/// Source of "now". Tests pin a fixed instant; the server uses the
/// system clock.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(NaiveDateTime),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn fixed(at: NaiveDateTime) -> Self {
        Clock::Fixed(at)
    }

    pub fn now(&self) -> NaiveDateTime {
        match self {
            Clock::System => Local::now().naive_local(),
            Clock::Fixed(at) => *at,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Day name as stored in schedules and store hours ("Monday" .. "Sunday").
pub fn weekday_name(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

// ─── Store hours ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHours {
    pub weekday: String,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    pub is_closed: bool,
}

/// Seed the default week (10:00–18:00, open every day). Existing rows win.
pub fn seed_store_hours(conn: &Connection) -> Result<(), DatabaseError> {
    for day in [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ] {
        conn.execute(
            "INSERT OR IGNORE INTO store_hours (weekday, open_time, close_time, is_closed)
             VALUES (?1, '10:00', '18:00', 0)",
            params![day],
        )?;
    }
    Ok(())
}

pub fn store_hours_for(
    conn: &Connection,
    weekday: &str,
) -> Result<Option<StoreHours>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT weekday, open_time, close_time, is_closed
             FROM store_hours WHERE weekday = ?1",
            params![weekday],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((weekday, open, close, is_closed)) => Ok(Some(StoreHours {
            weekday,
            open_time: parse_time(&open)?,
            close_time: parse_time(&close)?,
            is_closed,
        })),
        None => Ok(None),
    }
}

pub fn set_store_hours(
    conn: &Connection,
    weekday: &str,
    open_time: NaiveTime,
    close_time: NaiveTime,
    is_closed: bool,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO store_hours (weekday, open_time, close_time, is_closed)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(weekday) DO UPDATE SET
             open_time = excluded.open_time,
             close_time = excluded.close_time,
             is_closed = excluded.is_closed",
        params![
            weekday,
            open_time.format("%H:%M").to_string(),
            close_time.format("%H:%M").to_string(),
            is_closed
        ],
    )?;
    Ok(())
}

// ─── Closed days ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedDay {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

pub fn add_closed_day(
    conn: &Connection,
    date: NaiveDate,
    reason: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO closed_days (date, reason) VALUES (?1, ?2)
         ON CONFLICT(date) DO UPDATE SET reason = excluded.reason",
        params![date, reason],
    )?;
    Ok(())
}

pub fn remove_closed_day(conn: &Connection, date: NaiveDate) -> Result<(), DatabaseError> {
    let changed = conn.execute("DELETE FROM closed_days WHERE date = ?1", params![date])?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "closed_day".into(),
            id: date.to_string(),
        });
    }
    Ok(())
}

pub fn closed_day(conn: &Connection, date: NaiveDate) -> Result<Option<ClosedDay>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT date, reason FROM closed_days WHERE date = ?1",
            params![date],
            |row| Ok(ClosedDay { date: row.get(0)?, reason: row.get(1)? }),
        )
        .optional()?;
    Ok(row)
}

pub fn is_closed_day(conn: &Connection, date: NaiveDate) -> Result<bool, DatabaseError> {
    Ok(closed_day(conn, date)?.is_some())
}
