//! Appointment engine. Owns the appointment entity and its state machine
//! (pending to confirmed to completed, cancelled as a sink) and drives slot
//! admission on every booking. Each mutation commits the target row, its
//! notifications and the history entry in one transaction; SMS jobs are
//! returned to the caller for post-commit dispatch.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::Clock;
use crate::catalog::{self, ItemRef};
use crate::db::DatabaseError;
use crate::history;
use crate::models::enums::{
    AppointmentStatus, HistoryAction, NotificationKind, RequestStatus, TemplateType,
};
use crate::notifications::{self, Recipient};
use crate::packages::{self, ConsumeOutcome};
use crate::requests;
use crate::slot_policy::{self, format_long_date, format_time_12h, RejectReason};
use crate::sms::{templates, SmsJob};
use crate::users::{self, User};

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Rejected(#[from] RejectReason),

    #[error("Cannot {action} an appointment in state {state}")]
    InvalidState {
        action: &'static str,
        state: AppointmentStatus,
    },

    #[error("Cannot {action} a request in state {state}")]
    InvalidRequestState {
        action: &'static str,
        state: RequestStatus,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(DatabaseError::from(e))
    }
}

pub(crate) fn not_found(entity_type: &str, id: &str) -> EngineError {
    EngineError::Database(DatabaseError::NotFound {
        entity_type: entity_type.into(),
        id: id.into(),
    })
}

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub patient_id: String,
    pub attendant_id: String,
    pub item: ItemRef,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AppointmentStatus,
    pub transaction_id: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Appointment {
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreatmentDetails {
    pub notes: Option<String>,
    pub products_used: Option<String>,
    pub duration_minutes: Option<i64>,
    pub next_appointment_recommended: Option<String>,
}

/// A successful booking plus the SMS queued for post-commit dispatch.
#[derive(Debug)]
pub struct BookingOutcome {
    pub appointment: Appointment,
    pub sms: Vec<SmsJob>,
}

/// Opaque 8-character uppercase handle shown to users.
pub fn new_transaction_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

// ─── Repository ─────────────────────────────────────────────────────────────

const APPOINTMENT_COLUMNS: &str =
    "id, patient_id, attendant_id, service_id, product_id, package_id,
     date, time, status, transaction_id, created_at, updated_at";

pub fn get_appointment(conn: &Connection, id: &str) -> Result<Appointment, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"),
            params![id],
            appointment_row,
        )
        .optional()?;
    match row {
        Some(row) => appointment_from_row(row),
        None => Err(DatabaseError::NotFound {
            entity_type: "appointment".into(),
            id: id.into(),
        }),
    }
}

pub fn list_for_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE patient_id = ?1 ORDER BY date DESC, time DESC"
    ))?;
    let rows = stmt.query_map(params![patient_id], appointment_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(appointment_from_row)
        .collect()
}

/// Pending and confirmed appointments for one attendant on one date.
/// The leave fan-out enumerates exactly this set.
pub fn live_for_attendant_on(
    conn: &Connection,
    attendant_id: &str,
    date: NaiveDate,
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE attendant_id = ?1 AND date = ?2 AND status IN ('pending', 'confirmed')
         ORDER BY time ASC"
    ))?;
    let rows = stmt.query_map(params![attendant_id, date], appointment_row)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?
        .into_iter()
        .map(appointment_from_row)
        .collect()
}

type AppointmentRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    NaiveDate,
    String,
    String,
    String,
    NaiveDateTime,
    NaiveDateTime,
);

fn appointment_row(row: &rusqlite::Row) -> rusqlite::Result<AppointmentRow> {
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
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn appointment_from_row(row: AppointmentRow) -> Result<Appointment, DatabaseError> {
    let (
        id,
        patient_id,
        attendant_id,
        service_id,
        product_id,
        package_id,
        date,
        time,
        status,
        transaction_id,
        created_at,
        updated_at,
    ) = row;
    let item = match (service_id, product_id, package_id) {
        (Some(s), None, None) => ItemRef::Service(s),
        (None, Some(p), None) => ItemRef::Product(p),
        (None, None, Some(k)) => ItemRef::Package(k),
        _ => {
            return Err(DatabaseError::ConstraintViolation(format!(
                "appointment {id} does not reference exactly one item"
            )))
        }
    };
    Ok(Appointment {
        id,
        patient_id,
        attendant_id,
        item,
        date,
        time: users::parse_time(&time)?,
        status: AppointmentStatus::from_str(&status)?,
        transaction_id,
        created_at,
        updated_at,
    })
}

fn set_status(
    conn: &Connection,
    id: &str,
    status: AppointmentStatus,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE appointments SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status.as_str(), now],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "appointment".into(),
            id: id.into(),
        });
    }
    Ok(())
}

// ─── Shared fan-out helpers ─────────────────────────────────────────────────

/// "Item - Patient" label for history entries.
pub(crate) fn appointment_label(
    conn: &Connection,
    appointment: &Appointment,
) -> Result<String, DatabaseError> {
    let item = catalog::item_name(conn, &appointment.item)?;
    let patient = users::get_user(conn, &appointment.patient_id)?;
    Ok(format!("{item} - {}", patient.full_name))
}

pub(crate) fn when_phrase(appointment: &Appointment) -> String {
    format!(
        "{} at {}",
        format_long_date(appointment.date),
        format_time_12h(appointment.time)
    )
}

/// Template context for appointment SMS.
pub(crate) fn sms_context(
    conn: &Connection,
    appointment: &Appointment,
) -> Result<HashMap<String, String>, DatabaseError> {
    let patient = users::get_user(conn, &appointment.patient_id)?;
    let attendant = users::get_user(conn, &appointment.attendant_id)?;
    Ok(HashMap::from([
        ("patient_name".to_string(), patient.full_name),
        (
            "appointment_date".to_string(),
            format_long_date(appointment.date),
        ),
        (
            "appointment_time".to_string(),
            format_time_12h(appointment.time),
        ),
        (
            "service_name".to_string(),
            catalog::item_name(conn, &appointment.item)?,
        ),
        ("attendant_name".to_string(), attendant.full_name),
    ]))
}

/// Render the first active template of `template_type` for the appointment's
/// patient. Patients without a phone on file simply get no SMS.
pub(crate) fn patient_template_sms(
    conn: &Connection,
    appointment: &Appointment,
    template_type: TemplateType,
    extra: &[(&str, &str)],
    sender: &str,
) -> Result<Option<SmsJob>, DatabaseError> {
    let patient = users::get_user(conn, &appointment.patient_id)?;
    let Some(phone) = patient.phone else {
        return Ok(None);
    };
    let Some(template) = templates::get_template(conn, template_type)? else {
        tracing::warn!("No active {} template", template_type.as_str());
        return Ok(None);
    };
    let mut context = sms_context(conn, appointment)?;
    for (k, v) in extra {
        context.insert((*k).to_string(), (*v).to_string());
    }
    Ok(Some(SmsJob {
        sender: sender.to_string(),
        phone,
        body: templates::render(&template.message, &context),
        template_type,
    }))
}

fn history_details(
    conn: &Connection,
    appointment: &Appointment,
) -> Result<serde_json::Value, DatabaseError> {
    let patient = users::get_user(conn, &appointment.patient_id)?;
    let attendant = users::get_user(conn, &appointment.attendant_id)?;
    Ok(serde_json::json!({
        "patient": patient.full_name,
        "item": catalog::item_name(conn, &appointment.item)?,
        "attendant": attendant.full_name,
        "date": appointment.date.to_string(),
        "time": appointment.time.format("%H:%M").to_string(),
        "status": appointment.status.as_str(),
        "transaction_id": appointment.transaction_id,
    }))
}

// ─── Booking ────────────────────────────────────────────────────────────────

pub fn book_service(
    conn: &mut Connection,
    clock: &Clock,
    patient_id: &str,
    service_id: &str,
    attendant_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<BookingOutcome, EngineError> {
    book(
        conn,
        clock,
        patient_id,
        ItemRef::Service(service_id.to_string()),
        attendant_id,
        date,
        time,
    )
}

/// Product pre-orders are assigned to the seeded counter attendant. Stock
/// is checked here but only decremented at confirmation.
pub fn book_product(
    conn: &mut Connection,
    clock: &Clock,
    patient_id: &str,
    product_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<BookingOutcome, EngineError> {
    let counter = users::get_user_by_username(conn, users::PRODUCT_COUNTER_USERNAME)?
        .ok_or_else(|| not_found("attendant", users::PRODUCT_COUNTER_USERNAME))?;
    book(
        conn,
        clock,
        patient_id,
        ItemRef::Product(product_id.to_string()),
        &counter.id,
        date,
        time,
    )
}

/// Books a package session. Opens the package ledger on the patient's first
/// booking; rejects when an existing ledger row is exhausted or past its
/// grace period.
pub fn book_package(
    conn: &mut Connection,
    clock: &Clock,
    patient_id: &str,
    package_id: &str,
    attendant_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<BookingOutcome, EngineError> {
    book(
        conn,
        clock,
        patient_id,
        ItemRef::Package(package_id.to_string()),
        attendant_id,
        date,
        time,
    )
}

fn book(
    conn: &mut Connection,
    clock: &Clock,
    patient_id: &str,
    item: ItemRef,
    attendant_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<BookingOutcome, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let patient = users::get_user(&tx, patient_id)?;
    let attendant = users::get_user(&tx, attendant_id)?;

    // Package ledger gate ahead of admission: an exhausted or lapsed ledger
    // refuses further bookings.
    let mut opens_package_ledger = false;
    if let ItemRef::Package(package_id) = &item {
        match packages::booking_for(&tx, patient_id, package_id)? {
            Some(booking) if !booking.is_active(now.date()) => {
                let name = catalog::item_name(&tx, &item)?;
                return Err(RejectReason::PackageUnavailable { name }.into());
            }
            Some(_) => {}
            None => opens_package_ledger = true,
        }
    }

    let snapshot = slot_policy::load_snapshot(&tx, now, date, time, attendant_id, &item, None)?;
    slot_policy::admit(&snapshot, date, time)?;

    let id = Uuid::new_v4().to_string();
    let transaction_id = new_transaction_id();
    let (service_id, product_id, package_id) = match &item {
        ItemRef::Service(s) => (Some(s.as_str()), None, None),
        ItemRef::Product(p) => (None, Some(p.as_str()), None),
        ItemRef::Package(k) => (None, None, Some(k.as_str())),
    };
    tx.execute(
        "INSERT INTO appointments
         (id, patient_id, attendant_id, service_id, product_id, package_id,
          date, time, status, transaction_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10, ?10)",
        params![
            id,
            patient_id,
            attendant_id,
            service_id,
            product_id,
            package_id,
            date,
            time.format("%H:%M").to_string(),
            transaction_id,
            now
        ],
    )
    .map_err(DatabaseError::from)?;
    let appointment = get_appointment(&tx, &id)?;

    let mut sms = Vec::new();
    if opens_package_ledger {
        if let ItemRef::Package(package_id) = &item {
            let package = catalog::get_package(&tx, package_id)?
                .ok_or_else(|| not_found("package", package_id))?;
            let ledger = packages::open_booking(&tx, patient_id, &package, now)?;
            sms.extend(package_confirmation_sms(&tx, &patient, &package, &ledger)?);
        }
    }

    fan_out_booking(&tx, &appointment, &patient, &attendant, now)?;

    sms.extend(patient_template_sms(
        &tx,
        &appointment,
        TemplateType::Confirmation,
        &[],
        &patient.username,
    )?);
    sms.extend(attendant_assignment_sms(&tx, &appointment, &patient)?);

    tx.commit().map_err(DatabaseError::from)?;
    Ok(BookingOutcome { appointment, sms })
}

fn fan_out_booking(
    tx: &Transaction,
    appointment: &Appointment,
    patient: &User,
    attendant: &User,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let item = catalog::item_name(tx, &appointment.item)?;
    let when = when_phrase(appointment);

    notifications::enqueue(
        tx,
        Recipient::User(patient.id.clone()),
        NotificationKind::Appointment,
        "Appointment Booked",
        &format!(
            "Your appointment for {item} on {when} is pending approval. Transaction ID: {}",
            appointment.transaction_id
        ),
        Some(&appointment.id),
        now,
    )?;
    notifications::enqueue(
        tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Appointment,
        "New Appointment",
        &format!(
            "{} booked {item} with {} on {when}.",
            patient.full_name, attendant.full_name
        ),
        Some(&appointment.id),
        now,
    )?;
    notifications::enqueue(
        tx,
        Recipient::User(attendant.id.clone()),
        NotificationKind::Appointment,
        "New Appointment Assigned",
        &format!("{} booked {item} with you on {when}.", patient.full_name),
        Some(&appointment.id),
        now,
    )?;

    history::append(
        tx,
        HistoryAction::Book,
        "appointment",
        &appointment.id,
        &appointment_label(tx, appointment)?,
        &patient.username,
        history_details(tx, appointment)?,
        now,
    )?;
    Ok(())
}

fn attendant_assignment_sms(
    conn: &Connection,
    appointment: &Appointment,
    patient: &User,
) -> Result<Option<SmsJob>, DatabaseError> {
    let Some(schedule) = users::get_schedule(conn, &appointment.attendant_id)? else {
        return Ok(None);
    };
    let Some(phone) = schedule.phone else {
        return Ok(None);
    };
    let item = catalog::item_name(conn, &appointment.item)?;
    Ok(Some(SmsJob {
        sender: patient.username.clone(),
        phone,
        body: format!(
            "New appointment assigned: {} on {} for {item}.",
            patient.full_name,
            when_phrase(appointment)
        ),
        template_type: TemplateType::Custom,
    }))
}

fn package_confirmation_sms(
    conn: &Connection,
    patient: &User,
    package: &catalog::Package,
    ledger: &packages::PackageBooking,
) -> Result<Option<SmsJob>, DatabaseError> {
    let Some(phone) = patient.phone.clone() else {
        return Ok(None);
    };
    let Some(template) = templates::get_template(conn, TemplateType::PackageConfirmation)? else {
        return Ok(None);
    };
    let context = HashMap::from([
        ("patient_name".to_string(), patient.full_name.clone()),
        ("package_name".to_string(), package.name.clone()),
        (
            "package_price".to_string(),
            format!("P{:.2}", package.price.unwrap_or(0.0)),
        ),
        (
            "package_sessions".to_string(),
            ledger.sessions_remaining.to_string(),
        ),
        (
            "package_duration".to_string(),
            format!("{} days", package.duration_days),
        ),
    ]);
    Ok(Some(SmsJob {
        sender: patient.username.clone(),
        phone,
        body: templates::render(&template.message, &context),
        template_type: TemplateType::PackageConfirmation,
    }))
}

// ─── Transitions ────────────────────────────────────────────────────────────

/// pending to confirmed. Product pre-orders take their unit of stock here;
/// a product that has since sold out rejects the confirm.
pub fn confirm(
    conn: &mut Connection,
    clock: &Clock,
    appointment_id: &str,
    actor: &User,
) -> Result<Vec<SmsJob>, EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let appointment = get_appointment(&tx, appointment_id)?;
    if appointment.status != AppointmentStatus::Pending {
        return Err(EngineError::InvalidState {
            action: "confirm",
            state: appointment.status,
        });
    }

    if let ItemRef::Product(product_id) = &appointment.item {
        if !catalog::try_reserve_stock(&tx, product_id, &actor.username, now)? {
            let product = catalog::item_name(&tx, &appointment.item)?;
            return Err(RejectReason::OutOfStock { product }.into());
        }
    }

    set_status(&tx, &appointment.id, AppointmentStatus::Confirmed, now)?;
    let appointment = get_appointment(&tx, appointment_id)?;

    let item = catalog::item_name(&tx, &appointment.item)?;
    let when = when_phrase(&appointment);
    notifications::enqueue(
        &tx,
        Recipient::User(appointment.patient_id.clone()),
        NotificationKind::Appointment,
        "Appointment Confirmed",
        &format!("Your appointment for {item} on {when} has been confirmed."),
        Some(&appointment.id),
        now,
    )?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Appointment,
        "Appointment Confirmed",
        &format!(
            "Appointment {} ({item}) was confirmed.",
            appointment.transaction_id
        ),
        Some(&appointment.id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Confirm,
        "appointment",
        &appointment.id,
        &appointment_label(&tx, &appointment)?,
        &actor.username,
        history_details(&tx, &appointment)?,
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

/// pending or confirmed to completed. Package sessions are consumed here;
/// past the grace period the completion is recorded but not decremented.
pub fn complete(
    conn: &mut Connection,
    clock: &Clock,
    appointment_id: &str,
    actor: &User,
    treatment: Option<&TreatmentDetails>,
) -> Result<(), EngineError> {
    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let appointment = get_appointment(&tx, appointment_id)?;
    if !appointment.is_live() {
        return Err(EngineError::InvalidState {
            action: "complete",
            state: appointment.status,
        });
    }

    set_status(&tx, &appointment.id, AppointmentStatus::Completed, now)?;
    let appointment = get_appointment(&tx, appointment_id)?;

    let mut details = history_details(&tx, &appointment)?;
    if let ItemRef::Package(package_id) = &appointment.item {
        if let Some(ledger) = packages::booking_for(&tx, &appointment.patient_id, package_id)? {
            match packages::consume_session(&tx, &ledger.id, now.date())? {
                ConsumeOutcome::Decremented { remaining } => {
                    details["sessions_remaining"] = serde_json::json!(remaining);
                }
                ConsumeOutcome::PastGrace => {
                    details["session_not_consumed"] = serde_json::json!("past_grace_period");
                }
                ConsumeOutcome::Exhausted => {
                    details["session_not_consumed"] = serde_json::json!("exhausted");
                }
            }
        }
    }

    if let Some(treatment) = treatment {
        tx.execute(
            "INSERT OR IGNORE INTO treatments
             (appointment_id, notes, products_used, duration_minutes,
              next_appointment_recommended, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                appointment.id,
                treatment.notes,
                treatment.products_used,
                treatment.duration_minutes,
                treatment.next_appointment_recommended,
                now
            ],
        )
        .map_err(DatabaseError::from)?;
    }

    notifications::enqueue(
        &tx,
        Recipient::User(appointment.patient_id.clone()),
        NotificationKind::Feedback,
        "Treatment Completed - Please Rate Your Experience",
        &format!(
            "Your {} appointment is complete. We would love to hear your feedback!",
            catalog::item_name(&tx, &appointment.item)?
        ),
        Some(&appointment.id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Complete,
        "appointment",
        &appointment.id,
        &appointment_label(&tx, &appointment)?,
        &actor.username,
        details,
        now,
    )?;

    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

/// pending or confirmed to cancelled, staff or owner path. Requires a reason
/// and leaves an approved cancellation record behind (an existing pending
/// patient request is approved instead of duplicated).
pub fn cancel(
    conn: &mut Connection,
    clock: &Clock,
    appointment_id: &str,
    actor: &User,
    reason: &str,
) -> Result<Vec<SmsJob>, EngineError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(EngineError::Validation(
            "Cancellation reason is required".into(),
        ));
    }

    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let appointment = get_appointment(&tx, appointment_id)?;
    if !appointment.is_live() {
        return Err(EngineError::InvalidState {
            action: "cancel",
            state: appointment.status,
        });
    }

    set_status(&tx, &appointment.id, AppointmentStatus::Cancelled, now)?;
    let appointment = get_appointment(&tx, appointment_id)?;

    requests::record_approved_cancellation(&tx, &appointment, reason, now)?;

    let item = catalog::item_name(&tx, &appointment.item)?;
    let when = when_phrase(&appointment);
    notifications::enqueue(
        &tx,
        Recipient::User(appointment.patient_id.clone()),
        NotificationKind::Cancellation,
        "Appointment Cancelled",
        &format!("Your appointment for {item} on {when} has been cancelled. Reason: {reason}"),
        Some(&appointment.id),
        now,
    )?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Cancellation,
        "Appointment Cancelled",
        &format!(
            "Appointment {} ({item}) was cancelled.",
            appointment.transaction_id
        ),
        Some(&appointment.id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Cancel,
        "appointment",
        &appointment.id,
        &appointment_label(&tx, &appointment)?,
        &actor.username,
        history_details(&tx, &appointment)?,
        now,
    )?;

    let sms = patient_template_sms(
        &tx,
        &appointment,
        TemplateType::Cancellation,
        &[("cancellation_reason", reason)],
        &actor.username,
    )?
    .into_iter()
    .collect();

    tx.commit().map_err(DatabaseError::from)?;
    Ok(sms)
}

pub fn get_treatment(
    conn: &Connection,
    appointment_id: &str,
) -> Result<Option<TreatmentDetails>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT notes, products_used, duration_minutes, next_appointment_recommended
             FROM treatments WHERE appointment_id = ?1",
            params![appointment_id],
            |row| {
                Ok(TreatmentDetails {
                    notes: row.get(0)?,
                    products_used: row.get(1)?,
                    duration_minutes: row.get(2)?,
                    next_appointment_recommended: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}


#[cfg(test)]
mod tests {
    use super::testutil::{fixture, t, tuesday};
    use super::*;
    use crate::db::open_memory_database;
    use crate::models::enums::UserRole;
    use crate::users::NewUser;

    #[test]
    fn booking_creates_pending_with_full_fan_out() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();

        let appointment = &outcome.appointment;
        assert_eq!(appointment.status, AppointmentStatus::Pending);
        assert_eq!(appointment.transaction_id.len(), 8);
        assert_eq!(
            appointment.transaction_id,
            appointment.transaction_id.to_uppercase()
        );

        // Three notifications: patient, owner broadcast, attendant.
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 3);
        let broadcast: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(broadcast, 1);

        // Two SMS queued: patient confirmation plus attendant assignment.
        assert_eq!(outcome.sms.len(), 2);
        assert!(outcome.sms.iter().any(|j| j.phone == "09171234567"));
        assert!(outcome.sms.iter().any(|j| j.phone == "09181234567"));

        let trail = history::for_entity(&conn, "appointment", &appointment.id).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, HistoryAction::Book);
    }

    #[test]
    fn fourth_booking_at_slot_is_rejected_without_rows() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        for i in 0..3 {
            let patient = users::create_user(
                &conn,
                &NewUser {
                    username: &format!("patient{i}"),
                    full_name: &format!("Patient {i}"),
                    role: UserRole::Patient,
                    phone: None,
                    email: None,
                },
                fx.clock.now(),
            )
            .unwrap();
            book_service(
                &mut conn,
                &fx.clock,
                &patient.id,
                &fx.service_id,
                &fx.attendant.id,
                tuesday(),
                t(14, 0),
            )
            .unwrap();
        }

        let before: i64 = conn
            .query_row("SELECT COUNT(*) FROM appointments", [], |r| r.get(0))
            .unwrap();
        let err = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(14, 0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rejected(RejectReason::FullyBooked)
        ));
        let after: i64 = conn
            .query_row("SELECT COUNT(*) FROM appointments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn cancelled_appointments_free_their_slot() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(14, 0),
        )
        .unwrap();
        cancel(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            "no show",
        )
        .unwrap();

        let live =
            slot_policy::live_count_at(&conn, tuesday(), t(14, 0), &fx.attendant.id, None).unwrap();
        assert_eq!(live, 0);
    }

    #[test]
    fn confirm_transitions_and_notifies() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        let sms = confirm(&mut conn, &fx.clock, &outcome.appointment.id, &fx.staff).unwrap();

        let appointment = get_appointment(&conn, &outcome.appointment.id).unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Confirmed);
        assert_eq!(sms.len(), 1);

        let trail = history::for_entity(&conn, "appointment", &appointment.id).unwrap();
        assert_eq!(trail.last().unwrap().action, HistoryAction::Confirm);
    }

    #[test]
    fn confirm_is_rejected_outside_pending() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        confirm(&mut conn, &fx.clock, &outcome.appointment.id, &fx.staff).unwrap();

        let err = confirm(&mut conn, &fx.clock, &outcome.appointment.id, &fx.staff).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                action: "confirm",
                state: AppointmentStatus::Confirmed
            }
        ));
    }

    #[test]
    fn product_stock_decrements_only_on_confirm() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        // stock = 1; both patients can still book.
        let first = book_product(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.product_id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        let other = users::create_user(
            &conn,
            &NewUser {
                username: "jose",
                full_name: "Jose Cruz",
                role: UserRole::Patient,
                phone: None,
                email: None,
            },
            fx.clock.now(),
        )
        .unwrap();
        let second = book_product(
            &mut conn,
            &fx.clock,
            &other.id,
            &fx.product_id,
            tuesday(),
            t(11, 0),
        )
        .unwrap();
        assert_eq!(
            catalog::get_product(&conn, &fx.product_id)
                .unwrap()
                .unwrap()
                .stock,
            1
        );

        confirm(&mut conn, &fx.clock, &first.appointment.id, &fx.staff).unwrap();
        assert_eq!(
            catalog::get_product(&conn, &fx.product_id)
                .unwrap()
                .unwrap()
                .stock,
            0
        );

        // Second confirm loses the race: out of stock, appointment stays pending.
        let err = confirm(&mut conn, &fx.clock, &second.appointment.id, &fx.staff).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rejected(RejectReason::OutOfStock { .. })
        ));
        assert_eq!(
            get_appointment(&conn, &second.appointment.id)
                .unwrap()
                .status,
            AppointmentStatus::Pending
        );
    }

    #[test]
    fn out_of_stock_product_cannot_be_booked() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);
        conn.execute("UPDATE products SET stock = 0", []).unwrap();

        let err = book_product(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.product_id,
            tuesday(),
            t(10, 0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rejected(RejectReason::OutOfStock { .. })
        ));
    }

    #[test]
    fn confirm_then_cancel_does_not_restock() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_product(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.product_id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        confirm(&mut conn, &fx.clock, &outcome.appointment.id, &fx.staff).unwrap();
        cancel(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            "changed mind",
        )
        .unwrap();

        assert_eq!(
            get_appointment(&conn, &outcome.appointment.id)
                .unwrap()
                .status,
            AppointmentStatus::Cancelled
        );
        assert_eq!(
            catalog::get_product(&conn, &fx.product_id)
                .unwrap()
                .unwrap()
                .stock,
            0
        );
    }

    #[test]
    fn cancel_requires_a_reason() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        let err = cancel(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            "  ",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn staff_cancel_leaves_approved_request_record() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        cancel(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            "emergency",
        )
        .unwrap();

        let (status, kind): (String, String) = conn
            .query_row(
                "SELECT status, appointment_type FROM cancellation_requests
                 WHERE appointment_id = ?1",
                params![outcome.appointment.id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "approved");
        assert_eq!(kind, "regular");
    }

    #[test]
    fn complete_books_treatment_and_prompts_feedback() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        confirm(&mut conn, &fx.clock, &outcome.appointment.id, &fx.staff).unwrap();
        complete(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            Some(&TreatmentDetails {
                notes: Some("mild redness".into()),
                duration_minutes: Some(45),
                ..Default::default()
            }),
        )
        .unwrap();

        let appointment = get_appointment(&conn, &outcome.appointment.id).unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Completed);

        let treatment = get_treatment(&conn, &appointment.id).unwrap().unwrap();
        assert_eq!(treatment.notes.as_deref(), Some("mild redness"));

        let prompt: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE kind = 'feedback' AND recipient_id = ?1",
                params![fx.patient.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(prompt, 1);
    }

    #[test]
    fn complete_from_pending_is_allowed() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        complete(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            None,
        )
        .unwrap();
        assert_eq!(
            get_appointment(&conn, &outcome.appointment.id)
                .unwrap()
                .status,
            AppointmentStatus::Completed
        );
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_service(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        let id = outcome.appointment.id.clone();
        complete(&mut conn, &fx.clock, &id, &fx.staff, None).unwrap();

        assert!(confirm(&mut conn, &fx.clock, &id, &fx.staff).is_err());
        assert!(complete(&mut conn, &fx.clock, &id, &fx.staff, None).is_err());
        assert!(cancel(&mut conn, &fx.clock, &id, &fx.staff, "late").is_err());
    }

    #[test]
    fn package_booking_opens_ledger_once() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        book_package(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.package_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        book_package(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.package_id,
            &fx.attendant.id,
            tuesday(),
            t(11, 0),
        )
        .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM package_bookings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn package_sessions_decrement_on_complete() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_package(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.package_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        complete(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            None,
        )
        .unwrap();

        let ledger = packages::booking_for(&conn, &fx.patient.id, &fx.package_id)
            .unwrap()
            .unwrap();
        assert_eq!(ledger.sessions_remaining, 3);
    }

    #[test]
    fn lapsed_package_ledger_blocks_new_bookings() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        book_package(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.package_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        // Push the ledger past its grace period.
        conn.execute(
            "UPDATE package_bookings SET grace_period_until = '2026-05-01'",
            [],
        )
        .unwrap();

        let err = book_package(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.package_id,
            &fx.attendant.id,
            tuesday(),
            t(11, 0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rejected(RejectReason::PackageUnavailable { .. })
        ));
    }

    #[test]
    fn completing_past_grace_records_without_decrement() {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);

        let outcome = book_package(
            &mut conn,
            &fx.clock,
            &fx.patient.id,
            &fx.package_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        conn.execute(
            "UPDATE package_bookings SET grace_period_until = '2026-05-01'",
            [],
        )
        .unwrap();

        complete(
            &mut conn,
            &fx.clock,
            &outcome.appointment.id,
            &fx.staff,
            None,
        )
        .unwrap();

        let ledger = packages::booking_for(&conn, &fx.patient.id, &fx.package_id)
            .unwrap()
            .unwrap();
        assert_eq!(ledger.sessions_remaining, 4);

        let trail = history::for_entity(&conn, "appointment", &outcome.appointment.id).unwrap();
        let complete_entry = trail
            .iter()
            .find(|e| e.action == HistoryAction::Complete)
            .unwrap();
        assert_eq!(
            complete_entry.details["session_not_consumed"],
            "past_grace_period"
        );
    }

    #[test]
    fn transaction_ids_are_short_and_uppercase() {
        for _ in 0..20 {
            let id = new_transaction_id();
            assert_eq!(id.len(), 8);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}
