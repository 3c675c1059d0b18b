//! Attendant leave and the unavailability fan-out.
//!
//! Approving a leave request touches every live appointment the attendant
//! holds on that date: each gets an unavailability record and a patient
//! notification, written atomically with the approval itself. Patient
//! responses are recorded only; acting on a choice is a separate staff
//! step.

use std::str::FromStr;

use chrono::{Days, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::appointment::{self, not_found, EngineError};
use crate::calendar::Clock;
use crate::config::LEAVE_HORIZON_DAYS;
use crate::db::DatabaseError;
use crate::history;
use crate::models::enums::{
    HistoryAction, NotificationKind, PatientChoice, RequestStatus, TemplateType,
    UnavailabilityStatus,
};
use crate::notifications::{self, Recipient};
use crate::slot_policy::format_long_date;
use crate::sms::SmsJob;
use crate::users::{self, User};

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: String,
    pub attendant_id: String,
    pub leave_date: NaiveDate,
    pub reason: String,
    pub status: RequestStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<NaiveDateTime>,
    pub rejection_reason: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailabilityRequest {
    pub id: String,
    pub appointment_id: String,
    pub reason: String,
    pub status: UnavailabilityStatus,
    pub patient_choice: Option<PatientChoice>,
    pub resolved_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Result of approving a leave request.
#[derive(Debug)]
pub struct LeaveApprovalOutcome {
    pub request: LeaveRequest,
    /// Appointments whose patients were put on notice.
    pub patients_notified: usize,
    pub sms: Vec<SmsJob>,
}

// ─── Leave repository ───────────────────────────────────────────────────────

pub fn get_leave(conn: &Connection, id: &str) -> Result<LeaveRequest, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, attendant_id, leave_date, reason, status, reviewed_by,
                    reviewed_at, rejection_reason, created_at
             FROM leave_requests WHERE id = ?1",
            params![id],
            leave_row,
        )
        .optional()?;
    match row {
        Some(row) => leave_from_row(row),
        None => Err(DatabaseError::NotFound {
            entity_type: "leave_request".into(),
            id: id.into(),
        }),
    }
}

pub fn list_leave_for_attendant(
    conn: &Connection,
    attendant_id: &str,
) -> Result<Vec<LeaveRequest>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, attendant_id, leave_date, reason, status, reviewed_by,
                reviewed_at, rejection_reason, created_at
         FROM leave_requests WHERE attendant_id = ?1
         ORDER BY leave_date DESC",
    )?;
    let rows = stmt.query_map(params![attendant_id], leave_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(leave_from_row)
        .collect()
}

pub fn list_pending_leave(conn: &Connection) -> Result<Vec<LeaveRequest>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, attendant_id, leave_date, reason, status, reviewed_by,
                reviewed_at, rejection_reason, created_at
         FROM leave_requests WHERE status = 'pending'
         ORDER BY leave_date ASC",
    )?;
    let rows = stmt.query_map([], leave_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(leave_from_row)
        .collect()
}

type LeaveRow = (
    String,
    String,
    NaiveDate,
    String,
    String,
    Option<String>,
    Option<NaiveDateTime>,
    Option<String>,
    NaiveDateTime,
);

fn leave_row(row: &rusqlite::Row) -> rusqlite::Result<LeaveRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn leave_from_row(row: LeaveRow) -> Result<LeaveRequest, DatabaseError> {
    let (
        id,
        attendant_id,
        leave_date,
        reason,
        status,
        reviewed_by,
        reviewed_at,
        rejection_reason,
        created_at,
    ) = row;
    Ok(LeaveRequest {
        id,
        attendant_id,
        leave_date,
        reason,
        status: RequestStatus::from_str(&status)?,
        reviewed_by,
        reviewed_at,
        rejection_reason,
        created_at,
    })
}

// ─── Leave flow ─────────────────────────────────────────────────────────────

/// Attendant files a leave request. The date must be strictly in the future
/// and within the 30-day horizon, and one request per date is allowed.
pub fn request_leave(
    conn: &mut Connection,
    clock: &Clock,
    attendant: &User,
    leave_date: NaiveDate,
    reason: &str,
) -> Result<LeaveRequest, EngineError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(EngineError::Validation("Leave reason is required".into()));
    }

    let now = clock.now();
    let today = now.date();
    if leave_date <= today {
        return Err(EngineError::Validation(
            "Leave date must be in the future".into(),
        ));
    }
    let horizon = today
        .checked_add_days(Days::new(LEAVE_HORIZON_DAYS as u64))
        .unwrap_or(today);
    if leave_date > horizon {
        return Err(EngineError::Validation(format!(
            "Leave can only be requested up to {LEAVE_HORIZON_DAYS} days in advance"
        )));
    }

    let tx = conn.transaction().map_err(DatabaseError::from)?;

    if users::get_schedule(&tx, &attendant.id)?.is_none() {
        return Err(EngineError::Validation(
            "You need a work schedule before filing leave".into(),
        ));
    }
    let duplicate: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM leave_requests WHERE attendant_id = ?1 AND leave_date = ?2",
            params![attendant.id, leave_date],
            |r| r.get(0),
        )
        .map_err(DatabaseError::from)?;
    if duplicate > 0 {
        return Err(EngineError::Validation(format!(
            "You already have a leave request for {}",
            format_long_date(leave_date)
        )));
    }

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO leave_requests (id, attendant_id, leave_date, reason, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![id, attendant.id, leave_date, reason, now],
    )
    .map_err(DatabaseError::from)?;

    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Leave,
        "New Leave Request",
        &format!(
            "{} requested leave on {}. Reason: {reason}",
            attendant.full_name,
            format_long_date(leave_date)
        ),
        None,
        now,
    )?;

    let request = get_leave(&tx, &id)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(request)
}

/// Approve a leave request and fan out to every live appointment the
/// attendant holds on that date. All rows commit together; the returned
/// SMS jobs are dispatched by the caller after the commit.
pub fn approve_leave(
    conn: &mut Connection,
    clock: &Clock,
    request_id: &str,
    reviewer: &User,
) -> Result<LeaveApprovalOutcome, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_leave(&tx, request_id)?;
    if request.status != RequestStatus::Pending {
        return Err(EngineError::InvalidRequestState {
            action: "approve",
            state: request.status,
        });
    }
    let attendant = users::get_user(&tx, &request.attendant_id)?;

    tx.execute(
        "UPDATE leave_requests SET status = 'approved', reviewed_by = ?2, reviewed_at = ?3
         WHERE id = ?1",
        params![request.id, reviewer.id, now],
    )
    .map_err(DatabaseError::from)?;

    let affected = appointment::live_for_attendant_on(&tx, &attendant.id, request.leave_date)?;
    let date_str = format_long_date(request.leave_date);
    let unavailability_reason = format!("{} is on leave on {date_str}", attendant.full_name);

    let mut sms = Vec::new();
    for appt in &affected {
        tx.execute(
            "INSERT INTO unavailability_requests (id, appointment_id, reason, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![Uuid::new_v4().to_string(), appt.id, unavailability_reason, now],
        )
        .map_err(DatabaseError::from)?;

        let patient = users::get_user(&tx, &appt.patient_id)?;
        notifications::enqueue(
            &tx,
            Recipient::User(patient.id.clone()),
            NotificationKind::Unavailability,
            "Attendant Unavailable - Please Choose an Option",
            &format!(
                "{} is unavailable for your appointment on {date_str}. Please choose: \
                 another attendant, a new schedule, or cancellation.",
                attendant.full_name
            ),
            Some(&appt.id),
            now,
        )?;
        if let Some(phone) = patient.phone.clone() {
            sms.push(SmsJob {
                sender: reviewer.username.clone(),
                phone,
                body: format!(
                    "Hi {}! Your attendant {} is unavailable on {date_str}. \
                     Please contact us or open the app to choose an option.",
                    patient.full_name, attendant.full_name
                ),
                template_type: TemplateType::Custom,
            });
        }
    }

    notifications::enqueue(
        &tx,
        Recipient::User(attendant.id.clone()),
        NotificationKind::Leave,
        "Leave Request Approved",
        &format!("Your leave on {date_str} has been approved."),
        None,
        now,
    )?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Leave,
        "Leave Request Approved",
        &format!(
            "Leave for {} on {date_str} was approved. {} patients have been notified.",
            attendant.full_name,
            affected.len()
        ),
        None,
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Approve,
        "leave_request",
        &request.id,
        &format!("Leave Request - {}", attendant.full_name),
        &reviewer.username,
        serde_json::json!({
            "leave_date": request.leave_date.to_string(),
            "patients_notified": affected.len(),
        }),
        now,
    )?;

    let request = get_leave(&tx, request_id)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(LeaveApprovalOutcome {
        request,
        patients_notified: affected.len(),
        sms,
    })
}

pub fn reject_leave(
    conn: &mut Connection,
    clock: &Clock,
    request_id: &str,
    reviewer: &User,
    rejection_reason: Option<&str>,
) -> Result<(), EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_leave(&tx, request_id)?;
    if request.status != RequestStatus::Pending {
        return Err(EngineError::InvalidRequestState {
            action: "reject",
            state: request.status,
        });
    }
    let attendant = users::get_user(&tx, &request.attendant_id)?;

    tx.execute(
        "UPDATE leave_requests
         SET status = 'rejected', reviewed_by = ?2, reviewed_at = ?3, rejection_reason = ?4
         WHERE id = ?1",
        params![request.id, reviewer.id, now, rejection_reason],
    )
    .map_err(DatabaseError::from)?;

    notifications::enqueue(
        &tx,
        Recipient::User(attendant.id.clone()),
        NotificationKind::Leave,
        "Leave Request Rejected",
        &format!(
            "Your leave request for {} has been rejected. Reason: {}",
            format_long_date(request.leave_date),
            rejection_reason.unwrap_or("Not specified")
        ),
        None,
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Reject,
        "leave_request",
        &request.id,
        &format!("Leave Request - {}", attendant.full_name),
        &reviewer.username,
        serde_json::json!({
            "leave_date": request.leave_date.to_string(),
            "rejection_reason": rejection_reason,
        }),
        now,
    )?;

    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

// ─── Unavailability ─────────────────────────────────────────────────────────

pub fn get_unavailability(
    conn: &Connection,
    id: &str,
) -> Result<UnavailabilityRequest, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, appointment_id, reason, status, patient_choice, resolved_at, created_at
             FROM unavailability_requests WHERE id = ?1",
            params![id],
            unavailability_row,
        )
        .optional()?;
    match row {
        Some(row) => unavailability_from_row(row),
        None => Err(DatabaseError::NotFound {
            entity_type: "unavailability_request".into(),
            id: id.into(),
        }),
    }
}

/// Pending unavailability notices on a patient's appointments.
pub fn pending_unavailability_for_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<UnavailabilityRequest>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.appointment_id, u.reason, u.status, u.patient_choice,
                u.resolved_at, u.created_at
         FROM unavailability_requests u
         JOIN appointments a ON a.id = u.appointment_id
         WHERE a.patient_id = ?1 AND u.status = 'pending'
         ORDER BY u.created_at ASC",
    )?;
    let rows = stmt.query_map(params![patient_id], unavailability_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(unavailability_from_row)
        .collect()
}

type UnavailabilityRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<NaiveDateTime>,
    NaiveDateTime,
);

fn unavailability_row(row: &rusqlite::Row) -> rusqlite::Result<UnavailabilityRow> {
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

fn unavailability_from_row(row: UnavailabilityRow) -> Result<UnavailabilityRequest, DatabaseError> {
    let (id, appointment_id, reason, status, patient_choice, resolved_at, created_at) = row;
    Ok(UnavailabilityRequest {
        id,
        appointment_id,
        reason,
        status: UnavailabilityStatus::from_str(&status)?,
        patient_choice: patient_choice
            .as_deref()
            .map(PatientChoice::from_str)
            .transpose()?,
        resolved_at,
        created_at,
    })
}

/// Record the patient's choice. The appointment itself is never mutated
/// here; staff act on the recorded choice through the normal flows.
pub fn resolve_unavailability(
    conn: &mut Connection,
    clock: &Clock,
    patient: &User,
    unavailability_id: &str,
    choice: PatientChoice,
) -> Result<UnavailabilityRequest, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let request = get_unavailability(&tx, unavailability_id)?;
    let appointment = appointment::get_appointment(&tx, &request.appointment_id)?;
    if appointment.patient_id != patient.id {
        return Err(not_found("unavailability_request", unavailability_id));
    }
    if request.status != UnavailabilityStatus::Pending {
        return Err(EngineError::Validation(
            "This unavailability notice has already been resolved".into(),
        ));
    }

    tx.execute(
        "UPDATE unavailability_requests
         SET status = 'resolved', patient_choice = ?2, resolved_at = ?3
         WHERE id = ?1",
        params![request.id, choice.as_str(), now],
    )
    .map_err(DatabaseError::from)?;

    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Unavailability,
        "Patient Responded to Unavailability",
        &format!(
            "{} chose \"{}\" for their appointment on {}.",
            patient.full_name,
            choice.as_str(),
            format_long_date(appointment.date)
        ),
        Some(&appointment.id),
        now,
    )?;

    let request = get_unavailability(&tx, unavailability_id)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(request)
}
