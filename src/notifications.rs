//! Notification sink. Append-only per-recipient queue with read state.
//! A row without a recipient is an owner broadcast, visible to any
//! owner or staff viewer.

use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::{NotificationKind, UserRole};
use crate::users::User;

/// How many unread rows the feed returns.
const FEED_LIMIT: i64 = 10;

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(String),
    OwnerBroadcast,
}

impl Recipient {
    fn user_id(&self) -> Option<&str> {
        match self {
            Recipient::User(id) => Some(id),
            Recipient::OwnerBroadcast => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    /// None is the owner-broadcast channel.
    pub recipient_id: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub appointment_id: Option<String>,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationFeed {
    pub notifications: Vec<Notification>,
    pub unread_count: i64,
}

// ─── Sink ───────────────────────────────────────────────────────────────────

pub fn enqueue(
    conn: &Connection,
    recipient: Recipient,
    kind: NotificationKind,
    title: &str,
    body: &str,
    appointment_id: Option<&str>,
    now: NaiveDateTime,
) -> Result<String, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notifications (id, recipient_id, kind, title, body, appointment_id, is_read, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![id, recipient.user_id(), kind.as_str(), title, body, appointment_id, now],
    )?;
    Ok(id)
}

/// Visibility filter per viewer role: patients and attendants see their own
/// rows; owner and staff see their own plus the broadcast channel.
fn audience_clause(viewer: &User) -> &'static str {
    match viewer.role {
        UserRole::Owner | UserRole::Staff => "(recipient_id = ?1 OR recipient_id IS NULL)",
        UserRole::Patient | UserRole::Attendant => "recipient_id = ?1",
    }
}

/// Latest unread notifications (up to 10) plus the total unread count.
pub fn unread_feed(conn: &Connection, viewer: &User) -> Result<NotificationFeed, DatabaseError> {
    let clause = audience_clause(viewer);
    let sql = format!(
        "SELECT id, recipient_id, kind, title, body, appointment_id, is_read, created_at
         FROM notifications
         WHERE {clause} AND is_read = 0
         ORDER BY created_at DESC, rowid DESC LIMIT {FEED_LIMIT}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![viewer.id], notification_row)?;
    let notifications = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(notification_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    let count_sql =
        format!("SELECT COUNT(*) FROM notifications WHERE {clause} AND is_read = 0");
    let unread_count: i64 = conn.query_row(&count_sql, params![viewer.id], |row| row.get(0))?;

    Ok(NotificationFeed {
        notifications,
        unread_count,
    })
}

/// Full visible list, newest first.
pub fn list_for(conn: &Connection, viewer: &User) -> Result<Vec<Notification>, DatabaseError> {
    let clause = audience_clause(viewer);
    let sql = format!(
        "SELECT id, recipient_id, kind, title, body, appointment_id, is_read, created_at
         FROM notifications WHERE {clause}
         ORDER BY created_at DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![viewer.id], notification_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(notification_from_row)
        .collect()
}

/// Mark one notification read. Only rows the viewer's audience covers can
/// be marked; anything else reads as not-found.
pub fn mark_read(conn: &Connection, viewer: &User, id: &str) -> Result<(), DatabaseError> {
    let clause = audience_clause(viewer);
    let sql = format!("UPDATE notifications SET is_read = 1 WHERE id = ?2 AND {clause}");
    let changed = conn.execute(&sql, params![viewer.id, id])?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "notification".into(),
            id: id.into(),
        });
    }
    Ok(())
}

pub fn mark_all_read(conn: &Connection, viewer: &User) -> Result<i64, DatabaseError> {
    let clause = audience_clause(viewer);
    let sql = format!("UPDATE notifications SET is_read = 1 WHERE {clause} AND is_read = 0");
    let changed = conn.execute(&sql, params![viewer.id])?;
    Ok(changed as i64)
}

type NotificationRow = (
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    bool,
    NaiveDateTime,
);

fn notification_row(row: &rusqlite::Row) -> rusqlite::Result<NotificationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn notification_from_row(row: NotificationRow) -> Result<Notification, DatabaseError> {
    let (id, recipient_id, kind, title, body, appointment_id, is_read, created_at) = row;
    Ok(Notification {
        id,
        recipient_id,
        kind: NotificationKind::from_str(&kind)?,
        title,
        body,
        appointment_id,
        is_read,
        created_at,
    })
}
