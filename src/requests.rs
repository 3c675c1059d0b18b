//! Cancellation and reschedule request records.
//!
//! Patients file requests; staff or owner resolve them. A request never
//! mutates its appointment until approval, and reschedule approval re-runs
//! full slot admission with the moving appointment excluded from the
//! capacity count.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::appointment::{
    self, not_found, patient_template_sms, when_phrase, Appointment, EngineError,
};
use crate::calendar::{self, Clock};
use crate::catalog::{self, ItemRef};
use crate::db::DatabaseError;
use crate::history;
use crate::models::enums::{HistoryAction, NotificationKind, RequestStatus, TemplateType};
use crate::notifications::{self, Recipient};
use crate::slot_policy::{self, RejectReason};
use crate::sms::SmsJob;
use crate::users::{self, User};

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub id: String,
    pub appointment_id: String,
    /// "regular" or "package"; package cancellations get separate triage.
    pub appointment_type: String,
    pub patient_id: String,
    pub reason: String,
    pub status: RequestStatus,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub id: String,
    pub appointment_id: String,
    pub patient_id: String,
    pub new_date: NaiveDate,
    pub new_time: NaiveTime,
    pub reason: Option<String>,
    pub status: RequestStatus,
    pub created_at: NaiveDateTime,
}

fn appointment_type(item: &ItemRef) -> &'static str {
    match item {
        ItemRef::Package(_) => "package",
        _ => "regular",
    }
}

// ─── Cancellation repository ────────────────────────────────────────────────

pub fn get_cancellation(
    conn: &Connection,
    id: &str,
) -> Result<CancellationRequest, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, appointment_id, appointment_type, patient_id, reason, status, created_at
             FROM cancellation_requests WHERE id = ?1",
            params![id],
            cancellation_row,
        )
        .optional()?;
    match row {
        Some(row) => cancellation_from_row(row),
        None => Err(DatabaseError::NotFound {
            entity_type: "cancellation_request".into(),
            id: id.into(),
        }),
    }
}

pub fn list_cancellations(conn: &Connection) -> Result<Vec<CancellationRequest>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, appointment_id, appointment_type, patient_id, reason, status, created_at
         FROM cancellation_requests ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map([], cancellation_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(cancellation_from_row)
        .collect()
}

fn pending_cancellation_for(
    conn: &Connection,
    appointment_id: &str,
) -> Result<Option<CancellationRequest>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, appointment_id, appointment_type, patient_id, reason, status, created_at
             FROM cancellation_requests
             WHERE appointment_id = ?1 AND status = 'pending'
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![appointment_id],
            cancellation_row,
        )
        .optional()?;
    row.map(cancellation_from_row).transpose()
}

type CancellationRow = (String, String, String, String, String, String, NaiveDateTime);

fn cancellation_row(row: &rusqlite::Row) -> rusqlite::Result<CancellationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn cancellation_from_row(row: CancellationRow) -> Result<CancellationRequest, DatabaseError> {
    let (id, appointment_id, appointment_type, patient_id, reason, status, created_at) = row;
    Ok(CancellationRequest {
        id,
        appointment_id,
        appointment_type,
        patient_id,
        reason,
        status: RequestStatus::from_str(&status)?,
        created_at,
    })
}

/// Staff-path bookkeeping: a direct cancel leaves an approved request row.
/// An existing pending patient request is approved in place instead of
/// duplicated.
pub(crate) fn record_approved_cancellation(
    conn: &Connection,
    appointment: &Appointment,
    reason: &str,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    if let Some(pending) = pending_cancellation_for(conn, &appointment.id)? {
        conn.execute(
            "UPDATE cancellation_requests SET status = 'approved' WHERE id = ?1",
            params![pending.id],
        )?;
        return Ok(());
    }
    conn.execute(
        "INSERT INTO cancellation_requests
         (id, appointment_id, appointment_type, patient_id, reason, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'approved', ?6)",
        params![
            Uuid::new_v4().to_string(),
            appointment.id,
            appointment_type(&appointment.item),
            appointment.patient_id,
            reason,
            now
        ],
    )?;
    Ok(())
}

// ─── Cancellation flow ──────────────────────────────────────────────────────

/// Patient files a cancellation request. The appointment is untouched until
/// staff approve. An existing pending request for the same appointment is
/// updated rather than duplicated.
pub fn request_cancellation(
    conn: &mut Connection,
    clock: &Clock,
    patient: &User,
    appointment_id: &str,
    reason: &str,
) -> Result<CancellationRequest, EngineError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(EngineError::Validation(
            "Cancellation reason is required".into(),
        ));
    }

    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let appointment = appointment::get_appointment(&tx, appointment_id)?;
    if appointment.patient_id != patient.id {
        return Err(not_found("appointment", appointment_id));
    }
    if !appointment.is_live() {
        return Err(EngineError::InvalidState {
            action: "cancel",
            state: appointment.status,
        });
    }

    let request_id = match pending_cancellation_for(&tx, &appointment.id)? {
        Some(pending) => {
            tx.execute(
                "UPDATE cancellation_requests SET reason = ?2 WHERE id = ?1",
                params![pending.id, reason],
            )
            .map_err(DatabaseError::from)?;
            pending.id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO cancellation_requests
                 (id, appointment_id, appointment_type, patient_id, reason, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    id,
                    appointment.id,
                    appointment_type(&appointment.item),
                    patient.id,
                    reason,
                    now
                ],
            )
            .map_err(DatabaseError::from)?;
            id
        }
    };

    // Appointments inside the next two days get flagged for urgent triage.
    let title = if (appointment.date - now.date()).num_days() < 2 {
        "New Cancellation Request (Within 2 Days)"
    } else {
        "New Cancellation Request"
    };
    let item = catalog::item_name(&tx, &appointment.item)?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Cancellation,
        title,
        &format!(
            "{} requested to cancel {item} on {}. Reason: {reason}",
            patient.full_name,
            when_phrase(&appointment)
        ),
        Some(&appointment.id),
        now,
    )?;

    let request = get_cancellation(&tx, &request_id)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(request)
}

/// Approve a pending cancellation request: the request flips to approved and
/// the appointment is cancelled in the same transaction.
pub fn approve_cancellation(
    conn: &mut Connection,
    clock: &Clock,
    request_id: &str,
    actor: &User,
) -> Result<Vec<SmsJob>, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_cancellation(&tx, request_id)?;
    if request.status != RequestStatus::Pending {
        return Err(EngineError::InvalidRequestState {
            action: "approve",
            state: request.status,
        });
    }

    tx.execute(
        "UPDATE cancellation_requests SET status = 'approved' WHERE id = ?1",
        params![request.id],
    )
    .map_err(DatabaseError::from)?;

    let appointment = appointment::get_appointment(&tx, &request.appointment_id)?;
    if appointment.is_live() {
        tx.execute(
            "UPDATE appointments SET status = 'cancelled', updated_at = ?2 WHERE id = ?1",
            params![appointment.id, now],
        )
        .map_err(DatabaseError::from)?;
    }

    let patient = users::get_user(&tx, &request.patient_id)?;
    let item = catalog::item_name(&tx, &appointment.item)?;
    notifications::enqueue(
        &tx,
        Recipient::User(patient.id.clone()),
        NotificationKind::Cancellation,
        "Cancellation Approved",
        &format!(
            "Your cancellation request for {item} on {} has been approved.",
            when_phrase(&appointment)
        ),
        Some(&appointment.id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Approve,
        "cancellation_request",
        &request.id,
        &format!("Cancellation Request - {}", patient.full_name),
        &actor.username,
        serde_json::json!({
            "appointment_id": appointment.id,
            "reason": request.reason,
        }),
        now,
    )?;

    let appointment = appointment::get_appointment(&tx, &request.appointment_id)?;
    let sms = patient_template_sms(
        &tx,
        &appointment,
        TemplateType::Cancellation,
        &[("cancellation_reason", request.reason.as_str())],
        &actor.username,
    )?
    .into_iter()
    .collect();

    tx.commit().map_err(DatabaseError::from)?;
    Ok(sms)
}

pub fn reject_cancellation(
    conn: &mut Connection,
    clock: &Clock,
    request_id: &str,
    actor: &User,
) -> Result<(), EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_cancellation(&tx, request_id)?;
    if request.status != RequestStatus::Pending {
        return Err(EngineError::InvalidRequestState {
            action: "reject",
            state: request.status,
        });
    }

    tx.execute(
        "UPDATE cancellation_requests SET status = 'rejected' WHERE id = ?1",
        params![request.id],
    )
    .map_err(DatabaseError::from)?;

    let patient = users::get_user(&tx, &request.patient_id)?;
    notifications::enqueue(
        &tx,
        Recipient::User(request.patient_id.clone()),
        NotificationKind::Cancellation,
        "Cancellation Request Rejected",
        "Your cancellation request has been rejected. Please contact us for more information.",
        Some(&request.appointment_id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Reject,
        "cancellation_request",
        &request.id,
        &format!("Cancellation Request - {}", patient.full_name),
        &actor.username,
        serde_json::json!({ "appointment_id": request.appointment_id }),
        now,
    )?;

    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

// ─── Reschedule repository ──────────────────────────────────────────────────

pub fn get_reschedule(conn: &Connection, id: &str) -> Result<RescheduleRequest, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, appointment_id, patient_id, new_date, new_time, reason, status, created_at
             FROM reschedule_requests WHERE id = ?1",
            params![id],
            reschedule_row,
        )
        .optional()?;
    match row {
        Some(row) => reschedule_from_row(row),
        None => Err(DatabaseError::NotFound {
            entity_type: "reschedule_request".into(),
            id: id.into(),
        }),
    }
}

pub fn list_reschedules(conn: &Connection) -> Result<Vec<RescheduleRequest>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, appointment_id, patient_id, new_date, new_time, reason, status, created_at
         FROM reschedule_requests ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map([], reschedule_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(reschedule_from_row)
        .collect()
}

fn pending_reschedule_for(
    conn: &Connection,
    appointment_id: &str,
) -> Result<Option<RescheduleRequest>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, appointment_id, patient_id, new_date, new_time, reason, status, created_at
             FROM reschedule_requests
             WHERE appointment_id = ?1 AND status = 'pending'
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![appointment_id],
            reschedule_row,
        )
        .optional()?;
    row.map(reschedule_from_row).transpose()
}

type RescheduleRow = (
    String,
    String,
    String,
    NaiveDate,
    String,
    Option<String>,
    String,
    NaiveDateTime,
);

fn reschedule_row(row: &rusqlite::Row) -> rusqlite::Result<RescheduleRow> {
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

fn reschedule_from_row(row: RescheduleRow) -> Result<RescheduleRequest, DatabaseError> {
    let (id, appointment_id, patient_id, new_date, new_time, reason, status, created_at) = row;
    Ok(RescheduleRequest {
        id,
        appointment_id,
        patient_id,
        new_date,
        new_time: users::parse_time(&new_time)?,
        reason,
        status: RequestStatus::from_str(&status)?,
        created_at,
    })
}

// ─── Reschedule flow ────────────────────────────────────────────────────────

/// Patient files a reschedule request. Same-day appointments cannot be
/// rescheduled, and the target slot gets a cheap sanity check here; full
/// admission runs again at approval time.
pub fn request_reschedule(
    conn: &mut Connection,
    clock: &Clock,
    patient: &User,
    appointment_id: &str,
    new_date: NaiveDate,
    new_time: NaiveTime,
    reason: Option<&str>,
) -> Result<RescheduleRequest, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let appointment = appointment::get_appointment(&tx, appointment_id)?;
    if appointment.patient_id != patient.id {
        return Err(not_found("appointment", appointment_id));
    }
    if !appointment.is_live() {
        return Err(EngineError::InvalidState {
            action: "reschedule",
            state: appointment.status,
        });
    }
    if (appointment.date - now.date()).num_days() < 1 {
        return Err(EngineError::Validation(
            "Rescheduling is not allowed when the appointment is within the same day".into(),
        ));
    }
    if new_date.and_time(new_time) <= now {
        return Err(RejectReason::PastDateTime.into());
    }
    if let Some(closed) = calendar::closed_day(&tx, new_date)? {
        return Err(RejectReason::ClosedDay {
            date: closed.date,
            reason: closed.reason,
        }
        .into());
    }

    let time_str = new_time.format("%H:%M").to_string();
    let request_id = match pending_reschedule_for(&tx, &appointment.id)? {
        Some(pending) => {
            tx.execute(
                "UPDATE reschedule_requests SET new_date = ?2, new_time = ?3, reason = ?4
                 WHERE id = ?1",
                params![pending.id, new_date, time_str, reason],
            )
            .map_err(DatabaseError::from)?;
            pending.id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO reschedule_requests
                 (id, appointment_id, patient_id, new_date, new_time, reason, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![id, appointment.id, patient.id, new_date, time_str, reason, now],
            )
            .map_err(DatabaseError::from)?;
            id
        }
    };

    let item = catalog::item_name(&tx, &appointment.item)?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Reschedule,
        "New Reschedule Request",
        &format!(
            "{} requested to move {item} from {} to {} at {}.",
            patient.full_name,
            when_phrase(&appointment),
            slot_policy::format_long_date(new_date),
            slot_policy::format_time_12h(new_time)
        ),
        Some(&appointment.id),
        now,
    )?;

    let request = get_reschedule(&tx, &request_id)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(request)
}

/// Approve a pending reschedule: full slot admission runs against the target
/// slot with the moving appointment excluded from the capacity count. On a
/// rejection the transaction rolls back and the request stays pending. On
/// success the appointment moves and drops back to pending for
/// re-confirmation.
pub fn approve_reschedule(
    conn: &mut Connection,
    clock: &Clock,
    request_id: &str,
    actor: &User,
) -> Result<Vec<SmsJob>, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_reschedule(&tx, request_id)?;
    if request.status != RequestStatus::Pending {
        return Err(EngineError::InvalidRequestState {
            action: "approve",
            state: request.status,
        });
    }

    let appointment = appointment::get_appointment(&tx, &request.appointment_id)?;
    if !appointment.is_live() {
        return Err(EngineError::InvalidState {
            action: "reschedule",
            state: appointment.status,
        });
    }

    let snapshot = slot_policy::load_snapshot(
        &tx,
        now,
        request.new_date,
        request.new_time,
        &appointment.attendant_id,
        &appointment.item,
        Some(&appointment.id),
    )?;
    slot_policy::admit(&snapshot, request.new_date, request.new_time)?;

    let old_date = appointment.date;
    let old_time = appointment.time;
    tx.execute(
        "UPDATE appointments SET date = ?2, time = ?3, status = 'pending', updated_at = ?4
         WHERE id = ?1",
        params![
            appointment.id,
            request.new_date,
            request.new_time.format("%H:%M").to_string(),
            now
        ],
    )
    .map_err(DatabaseError::from)?;
    tx.execute(
        "UPDATE reschedule_requests SET status = 'approved' WHERE id = ?1",
        params![request.id],
    )
    .map_err(DatabaseError::from)?;

    let appointment = appointment::get_appointment(&tx, &request.appointment_id)?;
    let patient = users::get_user(&tx, &appointment.patient_id)?;
    let item = catalog::item_name(&tx, &appointment.item)?;
    let new_when = when_phrase(&appointment);

    notifications::enqueue(
        &tx,
        Recipient::User(patient.id.clone()),
        NotificationKind::Reschedule,
        "Reschedule Request Approved",
        &format!(
            "Your reschedule request for {item} has been approved. New date and time: {new_when}."
        ),
        Some(&appointment.id),
        now,
    )?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Reschedule,
        "Appointment Rescheduled",
        &format!(
            "{}'s {item} appointment moved to {new_when}.",
            patient.full_name
        ),
        Some(&appointment.id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Reschedule,
        "appointment",
        &appointment.id,
        &appointment::appointment_label(&tx, &appointment)?,
        &actor.username,
        serde_json::json!({
            "old_date": old_date.to_string(),
            "old_time": old_time.format("%H:%M").to_string(),
            "new_date": appointment.date.to_string(),
            "new_time": appointment.time.format("%H:%M").to_string(),
        }),
        now,
    )?;

    let sms = patient_template_sms(
        &tx,
        &appointment,
        TemplateType::Confirmation,
        &[],
        &actor.username,
    )?
    .into_iter()
    .collect();

    tx.commit().map_err(DatabaseError::from)?;
    Ok(sms)
}

pub fn reject_reschedule(
    conn: &mut Connection,
    clock: &Clock,
    request_id: &str,
    actor: &User,
) -> Result<(), EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_reschedule(&tx, request_id)?;
    if request.status != RequestStatus::Pending {
        return Err(EngineError::InvalidRequestState {
            action: "reject",
            state: request.status,
        });
    }

    tx.execute(
        "UPDATE reschedule_requests SET status = 'rejected' WHERE id = ?1",
        params![request.id],
    )
    .map_err(DatabaseError::from)?;

    let patient = users::get_user(&tx, &request.patient_id)?;
    notifications::enqueue(
        &tx,
        Recipient::User(request.patient_id.clone()),
        NotificationKind::Reschedule,
        "Reschedule Request Rejected",
        "Your reschedule request has been rejected. Please contact us for more information.",
        Some(&request.appointment_id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Reject,
        "reschedule_request",
        &request.id,
        &format!("Reschedule Request - {}", patient.full_name),
        &actor.username,
        serde_json::json!({ "appointment_id": request.appointment_id }),
        now,
    )?;

    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}
