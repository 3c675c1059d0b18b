//! Slot admission policy. A pure predicate over a snapshot read inside the
//! booking transaction: may this (date, time, attendant, item) be booked?
//!
//! Checks run in a fixed order because earlier rejections carry the more
//! specific user-facing message (closed day before lead time before
//! capacity).

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection};

use crate::calendar::{self, ClosedDay, StoreHours};
use crate::catalog::{item_snapshot, ItemRef, ItemSnapshot};
use crate::config::SLOT_CAPACITY;
use crate::db::DatabaseError;
use crate::models::enums::ItemKind;
use crate::users::{self, AttendantSchedule};

// ─── Rejection reasons ──────────────────────────────────────────────────────

/// Why a slot was refused. Rendered directly to users.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("Appointment date and time must be in the future")]
    PastDateTime,

    #[error("The clinic is closed on {}{}", format_long_date(*date), reason_suffix(reason))]
    ClosedDay {
        date: NaiveDate,
        reason: Option<String>,
    },

    #[error("The clinic does not open on {weekday}")]
    StoreClosed { weekday: String },

    #[error("The last available booking time is {} (1 hour before closing)", format_time_12h(*latest))]
    TooLateInDay { latest: NaiveTime },

    #[error("{attendant} is not available at the selected date and time")]
    AttendantUnavailable { attendant: String },

    #[error("This time slot is fully booked. Please choose a different time")]
    FullyBooked,

    #[error("{product} is currently out of stock")]
    OutOfStock { product: String },

    #[error("{name} is no longer offered")]
    ItemArchived { name: String },

    #[error("{name} has no remaining sessions or its validity has lapsed")]
    PackageUnavailable { name: String },
}

pub(crate) fn format_long_date(date: NaiveDate) -> String {
    date.format("%B %d, %Y").to_string()
}

pub(crate) fn format_time_12h(time: NaiveTime) -> String {
    // %I pads the hour ("05:00 PM"); the clinic renders "5:00 PM".
    let formatted = time.format("%I:%M %p").to_string();
    formatted.trim_start_matches('0').to_string()
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) if !r.is_empty() => format!(" ({r})"),
        _ => String::new(),
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Everything `admit` needs, read under the caller's transaction.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub now: NaiveDateTime,
    pub closed_day: Option<ClosedDay>,
    pub store_hours: Option<StoreHours>,
    pub attendant_name: String,
    pub schedule: Option<AttendantSchedule>,
    /// pending + confirmed appointments already at (date, time, attendant).
    pub booked_count: i64,
    pub item: ItemSnapshot,
}

/// Count of live (pending or confirmed) appointments at a slot.
/// `exclude` skips one appointment id — used when rescheduling into a slot.
pub fn live_count_at(
    conn: &Connection,
    date: NaiveDate,
    time: NaiveTime,
    attendant_id: &str,
    exclude: Option<&str>,
) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM appointments
         WHERE date = ?1 AND time = ?2 AND attendant_id = ?3
           AND status IN ('pending', 'confirmed')
           AND (?4 IS NULL OR id != ?4)",
        params![date, time.format("%H:%M").to_string(), attendant_id, exclude],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Assemble the admission snapshot inside the caller's transaction.
pub fn load_snapshot(
    conn: &Connection,
    now: NaiveDateTime,
    date: NaiveDate,
    time: NaiveTime,
    attendant_id: &str,
    item: &ItemRef,
    exclude_appointment: Option<&str>,
) -> Result<SlotSnapshot, DatabaseError> {
    let attendant = users::get_user(conn, attendant_id)?;
    Ok(SlotSnapshot {
        now,
        closed_day: calendar::closed_day(conn, date)?,
        store_hours: calendar::store_hours_for(conn, calendar::weekday_name(date))?,
        attendant_name: attendant.full_name,
        schedule: users::get_schedule(conn, attendant_id)?,
        booked_count: live_count_at(conn, date, time, attendant_id, exclude_appointment)?,
        item: item_snapshot(conn, item)?,
    })
}

// ─── Admission ──────────────────────────────────────────────────────────────

/// Pure admission check over a snapshot, in fixed order:
/// lead time, closed day, store hours, attendant schedule, capacity,
/// stock, archived.
pub fn admit(
    snapshot: &SlotSnapshot,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<(), RejectReason> {
    // 1. Booking must start after now.
    if date.and_time(time) <= snapshot.now {
        return Err(RejectReason::PastDateTime);
    }

    // 2. Closed-day set overrides everything else about the date.
    if let Some(closed) = &snapshot.closed_day {
        return Err(RejectReason::ClosedDay {
            date: closed.date,
            reason: closed.reason.clone(),
        });
    }

    // 3. Store hours: no booking in the final hour before close.
    match &snapshot.store_hours {
        Some(hours) if hours.is_closed => {
            return Err(RejectReason::StoreClosed {
                weekday: hours.weekday.clone(),
            })
        }
        Some(hours) => {
            let latest = hours.close_time - Duration::hours(1);
            if time >= latest {
                return Err(RejectReason::TooLateInDay { latest });
            }
        }
        None => {
            return Err(RejectReason::StoreClosed {
                weekday: calendar::weekday_name(date).to_string(),
            })
        }
    }

    // 4. Attendant schedule. No schedule on file means not bookable.
    let available = snapshot.schedule.as_ref().is_some_and(|s| {
        s.work_days.iter().any(|d| d == calendar::weekday_name(date))
            && s.start_time <= time
            && time < s.end_time
    });
    if !available {
        return Err(RejectReason::AttendantUnavailable {
            attendant: snapshot.attendant_name.clone(),
        });
    }

    // 5. Slot capacity.
    if snapshot.booked_count >= SLOT_CAPACITY {
        return Err(RejectReason::FullyBooked);
    }

    // 6. Product pre-orders need stock on hand at booking time.
    if snapshot.item.kind == ItemKind::Product && snapshot.item.stock.unwrap_or(0) <= 0 {
        return Err(RejectReason::OutOfStock {
            product: snapshot.item.name.clone(),
        });
    }

    // 7. Archived items are not bookable.
    if snapshot.item.archived {
        return Err(RejectReason::ItemArchived {
            name: snapshot.item.name.clone(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::ItemKind;

    fn base_snapshot() -> SlotSnapshot {
        SlotSnapshot {
            now: NaiveDate::from_ymd_opt(2026, 6, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            closed_day: None,
            store_hours: Some(StoreHours {
                weekday: "Tuesday".into(),
                open_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                close_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                is_closed: false,
            }),
            attendant_name: "Ana Reyes".into(),
            schedule: Some(AttendantSchedule {
                user_id: "a1".into(),
                work_days: vec!["Monday".into(), "Tuesday".into(), "Saturday".into()],
                start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                phone: None,
            }),
            booked_count: 0,
            item: ItemSnapshot {
                kind: ItemKind::Service,
                name: "Diamond Peel".into(),
                archived: false,
                stock: None,
            },
        }
    }

    // 2026-06-02 is a Tuesday.
    fn tuesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 2).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn accepts_a_plain_slot() {
        assert_eq!(admit(&base_snapshot(), tuesday(), t(10, 0)), Ok(()));
    }

    #[test]
    fn rejects_past_datetime() {
        let snapshot = base_snapshot();
        let past = NaiveDate::from_ymd_opt(2026, 5, 31).unwrap();
        assert_eq!(
            admit(&snapshot, past, t(10, 0)),
            Err(RejectReason::PastDateTime)
        );
        // Same-day earlier time is also in the past.
        assert_eq!(
            admit(&snapshot, snapshot.now.date(), t(8, 0)),
            Err(RejectReason::PastDateTime)
        );
    }

    #[test]
    fn closed_day_wins_over_other_checks() {
        let mut snapshot = base_snapshot();
        snapshot.closed_day = Some(ClosedDay {
            date: tuesday(),
            reason: Some("Renovation".into()),
        });
        snapshot.booked_count = 5;
        let err = admit(&snapshot, tuesday(), t(10, 0)).unwrap_err();
        assert!(matches!(err, RejectReason::ClosedDay { .. }));
        assert_eq!(
            err.to_string(),
            "The clinic is closed on June 02, 2026 (Renovation)"
        );
    }

    #[test]
    fn final_hour_boundary() {
        let snapshot = base_snapshot();
        // close − 1h exactly: rejected.
        assert_eq!(
            admit(&snapshot, tuesday(), t(17, 0)),
            Err(RejectReason::TooLateInDay { latest: t(17, 0) })
        );
        // One minute earlier: accepted.
        assert_eq!(admit(&snapshot, tuesday(), t(16, 59)), Ok(()));
    }

    #[test]
    fn too_late_message_names_the_cutoff() {
        let snapshot = base_snapshot();
        let err = admit(&snapshot, tuesday(), t(17, 30)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The last available booking time is 5:00 PM (1 hour before closing)"
        );
    }

    #[test]
    fn rejects_outside_attendant_schedule() {
        let snapshot = base_snapshot();
        // Wednesday is not in work_days.
        let wednesday = NaiveDate::from_ymd_opt(2026, 6, 3).unwrap();
        assert!(matches!(
            admit(&snapshot, wednesday, t(10, 0)),
            Err(RejectReason::AttendantUnavailable { .. })
        ));
    }

    #[test]
    fn rejects_without_schedule() {
        let mut snapshot = base_snapshot();
        snapshot.schedule = None;
        assert!(matches!(
            admit(&snapshot, tuesday(), t(10, 0)),
            Err(RejectReason::AttendantUnavailable { .. })
        ));
    }

    #[test]
    fn capacity_boundary_is_three() {
        let mut snapshot = base_snapshot();
        snapshot.booked_count = 2;
        assert_eq!(admit(&snapshot, tuesday(), t(14, 0)), Ok(()));
        snapshot.booked_count = 3;
        assert_eq!(
            admit(&snapshot, tuesday(), t(14, 0)),
            Err(RejectReason::FullyBooked)
        );
    }

    #[test]
    fn product_requires_stock() {
        let mut snapshot = base_snapshot();
        snapshot.item = ItemSnapshot {
            kind: ItemKind::Product,
            name: "Sunblock SPF50".into(),
            archived: false,
            stock: Some(0),
        };
        assert_eq!(
            admit(&snapshot, tuesday(), t(10, 0)),
            Err(RejectReason::OutOfStock {
                product: "Sunblock SPF50".into()
            })
        );
    }

    #[test]
    fn archived_item_rejected() {
        let mut snapshot = base_snapshot();
        snapshot.item.archived = true;
        assert!(matches!(
            admit(&snapshot, tuesday(), t(10, 0)),
            Err(RejectReason::ItemArchived { .. })
        ));
    }

    #[test]
    fn store_closed_weekday_rejected() {
        let mut snapshot = base_snapshot();
        if let Some(hours) = snapshot.store_hours.as_mut() {
            hours.is_closed = true;
        }
        assert!(matches!(
            admit(&snapshot, tuesday(), t(10, 0)),
            Err(RejectReason::StoreClosed { .. })
        ));
    }
}
