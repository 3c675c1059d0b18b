//! Package ledger: per-patient session balances with a validity window and
//! a grace period. Sessions are consumed on completed package appointments;
//! past the grace period the completion is recorded but nothing is
//! decremented.

use chrono::{Days, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::Package;
use crate::db::DatabaseError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageBooking {
    pub id: String,
    pub patient_id: String,
    pub package_id: String,
    pub sessions_remaining: i64,
    pub valid_until: NaiveDate,
    pub grace_period_until: NaiveDate,
    pub created_at: NaiveDateTime,
}

impl PackageBooking {
    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.sessions_remaining > 0 && today <= self.grace_period_until
    }
}

/// Outcome of consuming a session on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Decremented { remaining: i64 },
    /// Past the grace period; recorded, not decremented.
    PastGrace,
    /// No sessions left; recorded, not decremented.
    Exhausted,
}

pub fn get_booking(conn: &Connection, id: &str) -> Result<PackageBooking, DatabaseError> {
    find_booking(conn, id)?.ok_or(DatabaseError::NotFound {
        entity_type: "package_booking".into(),
        id: id.into(),
    })
}

fn find_booking(conn: &Connection, id: &str) -> Result<Option<PackageBooking>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, patient_id, package_id, sessions_remaining, valid_until,
                    grace_period_until, created_at
             FROM package_bookings WHERE id = ?1",
            params![id],
            booking_row,
        )
        .optional()?;
    Ok(row)
}

/// Latest booking for a (patient, package) pair, if any.
pub fn booking_for(
    conn: &Connection,
    patient_id: &str,
    package_id: &str,
) -> Result<Option<PackageBooking>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, patient_id, package_id, sessions_remaining, valid_until,
                    grace_period_until, created_at
             FROM package_bookings
             WHERE patient_id = ?1 AND package_id = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![patient_id, package_id],
            booking_row,
        )
        .optional()?;
    Ok(row)
}

fn booking_row(row: &rusqlite::Row) -> rusqlite::Result<PackageBooking> {
    Ok(PackageBooking {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        package_id: row.get(2)?,
        sessions_remaining: row.get(3)?,
        valid_until: row.get(4)?,
        grace_period_until: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Create a fresh ledger row for the patient's purchase of this package.
pub fn open_booking(
    conn: &Connection,
    patient_id: &str,
    package: &Package,
    now: NaiveDateTime,
) -> Result<PackageBooking, DatabaseError> {
    let today = now.date();
    let valid_until = today
        .checked_add_days(Days::new(package.duration_days.max(0) as u64))
        .unwrap_or(today);
    let grace_period_until = valid_until
        .checked_add_days(Days::new(package.grace_period_days.max(0) as u64))
        .unwrap_or(valid_until);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO package_bookings
         (id, patient_id, package_id, sessions_remaining, valid_until, grace_period_until, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            patient_id,
            package.id,
            package.sessions,
            valid_until,
            grace_period_until,
            now
        ],
    )?;
    get_booking(conn, &id)
}

/// Consume one session if the booking still has balance and is within its
/// grace period.
pub fn consume_session(
    conn: &Connection,
    booking_id: &str,
    today: NaiveDate,
) -> Result<ConsumeOutcome, DatabaseError> {
    let booking = get_booking(conn, booking_id)?;
    if today > booking.grace_period_until {
        return Ok(ConsumeOutcome::PastGrace);
    }
    if booking.sessions_remaining == 0 {
        return Ok(ConsumeOutcome::Exhausted);
    }
    conn.execute(
        "UPDATE package_bookings SET sessions_remaining = sessions_remaining - 1
         WHERE id = ?1 AND sessions_remaining > 0",
        params![booking_id],
    )?;
    let remaining = get_booking(conn, booking_id)?.sessions_remaining;
    Ok(ConsumeOutcome::Decremented { remaining })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::create_package;
    use crate::db::open_memory_database;
    use crate::users::{create_user, NewUser};
    use crate::models::enums::UserRole;

    fn setup() -> (Connection, String, Package) {
        let conn = open_memory_database().unwrap();
        let patient = create_user(
            &conn,
            &NewUser {
                username: "maria",
                full_name: "Maria Santos",
                role: UserRole::Patient,
                phone: None,
                email: None,
            },
            day(0).and_hms_opt(9, 0, 0).unwrap(),
        )
        .unwrap();
        let package = create_package(&conn, "Glow Package", Some(6000.0), 4, 90, 90).unwrap();
        (conn, patient.id, package)
    }

    fn day(offset: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .checked_add_days(Days::new(offset))
            .unwrap()
    }

    #[test]
    fn open_booking_sets_windows() {
        let (conn, patient_id, package) = setup();
        let booking = open_booking(
            &conn,
            &patient_id,
            &package,
            day(0).and_hms_opt(9, 0, 0).unwrap(),
        )
        .unwrap();

        assert_eq!(booking.sessions_remaining, 4);
        assert_eq!(booking.valid_until, day(90));
        assert_eq!(booking.grace_period_until, day(180));
        assert!(booking.is_active(day(0)));
    }

    #[test]
    fn consume_decrements_within_grace() {
        let (conn, patient_id, package) = setup();
        let booking = open_booking(&conn, &patient_id, &package, day(0).and_hms_opt(9, 0, 0).unwrap()).unwrap();

        for expected in [3, 2, 1] {
            let outcome = consume_session(&conn, &booking.id, day(10)).unwrap();
            assert_eq!(outcome, ConsumeOutcome::Decremented { remaining: expected });
        }

        // Past validity but within grace still decrements.
        let outcome = consume_session(&conn, &booking.id, day(181)).unwrap();
        assert_eq!(outcome, ConsumeOutcome::Decremented { remaining: 0 });
    }

    #[test]
    fn consume_past_grace_records_without_decrement() {
        let (conn, patient_id, package) = setup();
        let booking = open_booking(&conn, &patient_id, &package, day(0).and_hms_opt(9, 0, 0).unwrap()).unwrap();

        let outcome = consume_session(&conn, &booking.id, day(200)).unwrap();
        assert_eq!(outcome, ConsumeOutcome::PastGrace);
        assert_eq!(get_booking(&conn, &booking.id).unwrap().sessions_remaining, 4);
    }

    #[test]
    fn consume_exhausted_never_goes_negative() {
        let (conn, patient_id, package) = setup();
        let booking = open_booking(&conn, &patient_id, &package, day(0).and_hms_opt(9, 0, 0).unwrap()).unwrap();
        for _ in 0..4 {
            consume_session(&conn, &booking.id, day(1)).unwrap();
        }

        let outcome = consume_session(&conn, &booking.id, day(2)).unwrap();
        assert_eq!(outcome, ConsumeOutcome::Exhausted);
        assert_eq!(get_booking(&conn, &booking.id).unwrap().sessions_remaining, 0);
    }

    #[test]
    fn inactive_when_exhausted_or_past_grace() {
        let (conn, patient_id, package) = setup();
        let booking = open_booking(&conn, &patient_id, &package, day(0).and_hms_opt(9, 0, 0).unwrap()).unwrap();
        assert!(booking.is_active(day(180)));
        assert!(!booking.is_active(day(181)));
    }
}
