//! Append-only history log. Every state-changing action lands here;
//! nothing ever reads it back for state reconstruction.

use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::HistoryAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub action: HistoryAction,
    pub entity_kind: String,
    pub entity_id: String,
    pub entity_name: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[allow(clippy::too_many_arguments)]
pub fn append(
    conn: &Connection,
    action: HistoryAction,
    entity_kind: &str,
    entity_id: &str,
    entity_name: &str,
    actor: &str,
    details: serde_json::Value,
    now: NaiveDateTime,
) -> Result<String, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO history_log (id, action, entity_kind, entity_id, entity_name, actor, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            action.as_str(),
            entity_kind,
            entity_id,
            entity_name,
            actor,
            details.to_string(),
            now
        ],
    )?;
    Ok(id)
}

pub fn recent(conn: &Connection, limit: i64) -> Result<Vec<HistoryEntry>, DatabaseError> {
    query(
        conn,
        "SELECT id, action, entity_kind, entity_id, entity_name, actor, details, created_at
         FROM history_log ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        params![limit],
    )
}

pub fn recent_for_kind(
    conn: &Connection,
    entity_kind: &str,
    limit: i64,
) -> Result<Vec<HistoryEntry>, DatabaseError> {
    query(
        conn,
        "SELECT id, action, entity_kind, entity_id, entity_name, actor, details, created_at
         FROM history_log WHERE entity_kind = ?1
         ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        params![entity_kind, limit],
    )
}

/// All entries for one entity, oldest first (audit-trail reads).
pub fn for_entity(
    conn: &Connection,
    entity_kind: &str,
    entity_id: &str,
) -> Result<Vec<HistoryEntry>, DatabaseError> {
    query(
        conn,
        "SELECT id, action, entity_kind, entity_id, entity_name, actor, details, created_at
         FROM history_log WHERE entity_kind = ?1 AND entity_id = ?2
         ORDER BY created_at ASC, rowid ASC",
        params![entity_kind, entity_id],
    )
}

fn query(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<HistoryEntry>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, NaiveDateTime>(7)?,
        ))
    })?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(
            |(id, action, entity_kind, entity_id, entity_name, actor, details, created_at)| {
                Ok(HistoryEntry {
                    id,
                    action: HistoryAction::from_str(&action)?,
                    entity_kind,
                    entity_id,
                    entity_name,
                    actor,
                    details: details
                        .as_deref()
                        .and_then(|d| serde_json::from_str(d).ok())
                        .unwrap_or(serde_json::Value::Null),
                    created_at,
                })
            },
        )
        .collect()
}
