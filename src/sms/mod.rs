//! SMS dispatcher. Domain operations queue [`SmsJob`]s inside their
//! transaction; callers dispatch the queue only after the transaction
//! commits, so a slow or failing provider never blocks state progress.
//! Every attempt lands in the append-only `sms_messages` log.

pub mod phone;
pub mod provider;
pub mod templates;

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::Clock;
use crate::db::DatabaseError;
use crate::models::enums::{SmsStatus, TemplateType};
use provider::SmsTransport;

// ─── Types ──────────────────────────────────────────────────────────────────

/// A rendered message waiting for post-commit dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsJob {
    pub sender: String,
    pub phone: String,
    pub body: String,
    pub template_type: TemplateType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: String,
    pub sender: String,
    pub phone: String,
    pub body: String,
    pub template_type: TemplateType,
    pub status: SmsStatus,
    pub provider_message_id: Option<String>,
    pub provider_response: Option<String>,
    pub sent_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

// ─── History log ────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub fn record_attempt(
    conn: &Connection,
    job: &SmsJob,
    status: SmsStatus,
    provider_message_id: Option<&str>,
    provider_response: Option<&str>,
    now: NaiveDateTime,
) -> Result<String, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    let sent_at = match status {
        SmsStatus::Sent => Some(now),
        _ => None,
    };
    conn.execute(
        "INSERT INTO sms_messages
         (id, sender, phone, body, template_type, status, provider_message_id,
          provider_response, sent_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            job.sender,
            job.phone,
            job.body,
            job.template_type.as_str(),
            status.as_str(),
            provider_message_id,
            provider_response,
            sent_at,
            now
        ],
    )?;
    Ok(id)
}

pub fn list_messages(conn: &Connection, limit: i64) -> Result<Vec<SmsMessage>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, sender, phone, body, template_type, status, provider_message_id,
                provider_response, sent_at, created_at
         FROM sms_messages ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<NaiveDateTime>>(8)?,
            row.get::<_, NaiveDateTime>(9)?,
        ))
    })?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(
            |(id, sender, phone, body, template_type, status, pmid, presp, sent_at, created_at)| {
                Ok(SmsMessage {
                    id,
                    sender,
                    phone,
                    body,
                    template_type: TemplateType::from_str(&template_type)?,
                    status: SmsStatus::from_str(&status)?,
                    provider_message_id: pmid,
                    provider_response: presp,
                    sent_at,
                    created_at,
                })
            },
        )
        .collect()
}

// ─── Dispatch ───────────────────────────────────────────────────────────────

/// Deliver queued jobs and record every attempt. Called strictly after the
/// transaction that produced the jobs has committed. Failures are logged
/// and never propagate.
pub async fn dispatch_jobs(
    db: &Arc<Mutex<Connection>>,
    transport: &SmsTransport,
    clock: &Clock,
    jobs: Vec<SmsJob>,
) {
    for mut job in jobs {
        let normalized = match phone::normalize(&job.phone) {
            Ok(normalized) => normalized,
            Err(e) => {
                tracing::warn!(phone = %job.phone, "SMS skipped: {e}");
                record_outcome(db, &job, SmsStatus::Failed, None, Some(&e.to_string()), clock);
                continue;
            }
        };
        job.phone = normalized;

        match transport.deliver(&job.phone, &job.body).await {
            Ok(receipt) => {
                record_outcome(
                    db,
                    &job,
                    SmsStatus::Sent,
                    receipt.message_id.as_deref(),
                    Some(&receipt.raw_response),
                    clock,
                );
            }
            Err(e) => {
                tracing::warn!(phone = %job.phone, "SMS delivery failed: {e}");
                record_outcome(db, &job, SmsStatus::Failed, None, Some(&e.to_string()), clock);
            }
        }
    }
}

fn record_outcome(
    db: &Arc<Mutex<Connection>>,
    job: &SmsJob,
    status: SmsStatus,
    provider_message_id: Option<&str>,
    provider_response: Option<&str>,
    clock: &Clock,
) {
    let Ok(conn) = db.lock() else {
        tracing::error!("SMS log skipped: database lock poisoned");
        return;
    };
    if let Err(e) = record_attempt(
        &conn,
        job,
        status,
        provider_message_id,
        provider_response,
        clock.now(),
    ) {
        tracing::error!("Failed to record SMS attempt: {e}");
    }
}
