//! Patient feedback on completed appointments. Two ratings on a 1 to 5
//! scale: the service rating is required, the attendant rating optional.
//! One submission per (appointment, patient).

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::appointment::{self, not_found, EngineError};
use crate::calendar::Clock;
use crate::catalog;
use crate::db::DatabaseError;
use crate::history;
use crate::models::enums::{AppointmentStatus, HistoryAction, NotificationKind};
use crate::notifications::{self, Recipient};
use crate::users::User;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub appointment_id: String,
    pub patient_id: String,
    pub service_rating: i64,
    pub attendant_rating: Option<i64>,
    pub comment: Option<String>,
    pub created_at: NaiveDateTime,
}

fn valid_rating(rating: i64) -> bool {
    (1..=5).contains(&rating)
}

pub fn submit_feedback(
    conn: &mut Connection,
    clock: &Clock,
    patient: &User,
    appointment_id: &str,
    service_rating: i64,
    attendant_rating: Option<i64>,
    comment: Option<&str>,
) -> Result<Feedback, EngineError> {
    if !valid_rating(service_rating) {
        return Err(EngineError::Validation(
            "Service rating must be between 1 and 5".into(),
        ));
    }
    if let Some(rating) = attendant_rating {
        if !valid_rating(rating) {
            return Err(EngineError::Validation(
                "Attendant rating must be between 1 and 5".into(),
            ));
        }
    }

    let now = clock.now();
    let tx = conn.transaction().map_err(DatabaseError::from)?;

    let appointment = appointment::get_appointment(&tx, appointment_id)?;
    if appointment.patient_id != patient.id {
        return Err(not_found("appointment", appointment_id));
    }
    if appointment.status != AppointmentStatus::Completed {
        return Err(EngineError::InvalidState {
            action: "rate",
            state: appointment.status,
        });
    }
    if feedback_for_appointment(&tx, appointment_id)?
        .iter()
        .any(|f| f.patient_id == patient.id)
    {
        return Err(EngineError::Validation(
            "You have already submitted feedback for this appointment".into(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO feedback
         (id, appointment_id, patient_id, service_rating, attendant_rating, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            appointment.id,
            patient.id,
            service_rating,
            attendant_rating,
            comment,
            now
        ],
    )
    .map_err(DatabaseError::from)?;

    let item = catalog::item_name(&tx, &appointment.item)?;
    notifications::enqueue(
        &tx,
        Recipient::OwnerBroadcast,
        NotificationKind::Feedback,
        "New Feedback Received",
        &format!(
            "{} rated {item} {service_rating}/5.",
            patient.full_name
        ),
        Some(&appointment.id),
        now,
    )?;
    history::append(
        &tx,
        HistoryAction::Add,
        "feedback",
        &id,
        &format!("Feedback - {}", patient.full_name),
        &patient.username,
        serde_json::json!({
            "appointment_id": appointment.id,
            "service_rating": service_rating,
            "attendant_rating": attendant_rating,
        }),
        now,
    )?;

    let feedback = get_feedback(&tx, &id)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(feedback)
}

pub fn get_feedback(conn: &Connection, id: &str) -> Result<Feedback, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, appointment_id, patient_id, service_rating, attendant_rating,
                    comment, created_at
             FROM feedback WHERE id = ?1",
            params![id],
            feedback_row,
        )
        .optional()?;
    row.ok_or(DatabaseError::NotFound {
        entity_type: "feedback".into(),
        id: id.into(),
    })
}

pub fn feedback_for_appointment(
    conn: &Connection,
    appointment_id: &str,
) -> Result<Vec<Feedback>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, appointment_id, patient_id, service_rating, attendant_rating,
                comment, created_at
         FROM feedback WHERE appointment_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![appointment_id], feedback_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
}

pub fn list_feedback(conn: &Connection, limit: i64) -> Result<Vec<Feedback>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, appointment_id, patient_id, service_rating, attendant_rating,
                comment, created_at
         FROM feedback ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], feedback_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
}

fn feedback_row(row: &rusqlite::Row) -> rusqlite::Result<Feedback> {
    Ok(Feedback {
        id: row.get(0)?,
        appointment_id: row.get(1)?,
        patient_id: row.get(2)?,
        service_rating: row.get(3)?,
        attendant_rating: row.get(4)?,
        comment: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::testutil::{fixture, t, tuesday, Fixture};
    use crate::appointment::{book_service, complete};
    use crate::db::open_memory_database;
    use crate::models::enums::UserRole;
    use crate::users::{self, NewUser};

    fn completed(conn: &mut Connection) -> (Fixture, String) {
        let fx = fixture(conn);
        let outcome = book_service(
            conn,
            &fx.clock,
            &fx.patient.id,
            &fx.service_id,
            &fx.attendant.id,
            tuesday(),
            t(10, 0),
        )
        .unwrap();
        complete(conn, &fx.clock, &outcome.appointment.id, &fx.staff, None).unwrap();
        (fx, outcome.appointment.id)
    }

    #[test]
    fn feedback_on_completed_appointment() {
        let mut conn = open_memory_database().unwrap();
        let (fx, appointment_id) = completed(&mut conn);

        let feedback = submit_feedback(
            &mut conn,
            &fx.clock,
            &fx.patient,
            &appointment_id,
            5,
            Some(4),
            Some("lovely"),
        )
        .unwrap();

        assert_eq!(feedback.service_rating, 5);
        assert_eq!(feedback.attendant_rating, Some(4));

        let broadcast: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notifications
                 WHERE recipient_id IS NULL AND title = 'New Feedback Received'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(broadcast, 1);
    }

    #[test]
    fn attendant_rating_is_optional() {
        let mut conn = open_memory_database().unwrap();
        let (fx, appointment_id) = completed(&mut conn);

        let feedback =
            submit_feedback(&mut conn, &fx.clock, &fx.patient, &appointment_id, 3, None, None)
                .unwrap();
        assert_eq!(feedback.attendant_rating, None);
    }

    #[test]
    fn ratings_outside_scale_are_refused() {
        let mut conn = open_memory_database().unwrap();
        let (fx, appointment_id) = completed(&mut conn);

        for bad in [0, 6, -1] {
            let err = submit_feedback(
                &mut conn,
                &fx.clock,
                &fx.patient,
                &appointment_id,
                bad,
                None,
                None,
            )
            .unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
        }
        let err = submit_feedback(
            &mut conn,
            &fx.clock,
            &fx.patient,
            &appointment_id,
            5,
            Some(0),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn only_completed_appointments_can_be_rated() {
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

        let err = submit_feedback(
            &mut conn,
            &fx.clock,
            &fx.patient,
            &outcome.appointment.id,
            5,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                action: "rate",
                state: AppointmentStatus::Pending
            }
        ));
    }

    #[test]
    fn second_submission_is_refused() {
        let mut conn = open_memory_database().unwrap();
        let (fx, appointment_id) = completed(&mut conn);

        submit_feedback(&mut conn, &fx.clock, &fx.patient, &appointment_id, 5, None, None)
            .unwrap();
        let err =
            submit_feedback(&mut conn, &fx.clock, &fx.patient, &appointment_id, 4, None, None)
                .unwrap_err();
        assert!(err.to_string().contains("already submitted feedback"));
    }

    #[test]
    fn feedback_requires_the_appointment_owner() {
        let mut conn = open_memory_database().unwrap();
        let (fx, appointment_id) = completed(&mut conn);
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

        let err = submit_feedback(&mut conn, &fx.clock, &other, &appointment_id, 5, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Database(DatabaseError::NotFound { .. })
        ));
    }
}
