use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::slot;

/// Client identifier as issued by the authentication layer.
pub type UserId = u64;

/// Chat/session identifier the review workflow keys drafts by.
pub type SessionKey = i64;

/// Half-open time-of-day interval `[start, end)` inside one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        slot::overlaps(self.start, self.end, other.start, other.end)
    }
}

/// Booking state is sharded per (service, date).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub service_id: Ulid,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(service_id: Ulid, date: NaiveDate) -> Self {
        Self { service_id, date }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Price in minor currency units.
    pub price: u64,
    pub duration_minutes: u32,
    pub category_id: Option<Ulid>,
}

/// Input for `Engine::create_service`.
#[derive(Debug, Clone, Default)]
pub struct NewService {
    pub name: String,
    pub description: Option<String>,
    pub price: u64,
    pub duration_minutes: u32,
    pub category_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    /// Everything except a cancellation keeps its slot occupied.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub user_id: UserId,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub status: AppointmentStatus,
    pub cancellation_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub modified_at: Option<NaiveDateTime>,
}

impl Appointment {
    pub fn day_key(&self) -> DayKey {
        DayKey::new(self.service_id, self.date)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.end)
    }
}

/// Opaque token for a photo held by the media store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoRef(pub String);

impl PhotoRef {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhotoSlot {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: Ulid,
    pub user_id: UserId,
    pub appointment_id: Ulid,
    pub rating: u8,
    pub comment: String,
    pub photo_before: Option<PhotoRef>,
    pub photo_after: Option<PhotoRef>,
    pub created_at: NaiveDateTime,
}

/// One occupied interval in a day ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub appointment_id: Ulid,
    pub range: TimeRange,
}

/// Occupied intervals of one service on one date.
///
/// Only appointments that hold their slot live here; a cancellation removes
/// its booking.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub key: DayKey,
    /// Sorted by `range.start`.
    pub bookings: Vec<Booking>,
}

impl DayLedger {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping sort order by start time.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<Booking> {
        let pos = self
            .bookings
            .iter()
            .position(|b| b.appointment_id == appointment_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings overlapping `query`. Bookings starting at or after
    /// `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }

    pub fn busy_ranges(&self) -> Vec<TimeRange> {
        self.bookings.iter().map(|b| b.range).collect()
    }
}

/// Durable record format. Every committed state change is one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CategoryCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    ServiceCreated {
        service: Service,
    },
    /// Carries the whole record so compaction can re-emit current state.
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        modified_at: NaiveDateTime,
    },
    AppointmentCancelled {
        id: Ulid,
        reason: Option<String>,
        modified_at: NaiveDateTime,
    },
    AppointmentCompleted {
        id: Ulid,
        modified_at: NaiveDateTime,
    },
    ReviewSubmitted {
        review: Review,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Per-day summary of a service, as shown next to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceAvailability {
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub is_available: bool,
    pub open_slots: usize,
    pub price: u64,
    pub duration_minutes: u32,
}

/// Outcome of one reminder sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderReport {
    pub sent: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn key() -> DayKey {
        DayKey::new(Ulid::new(), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    fn booking(start: NaiveTime, end: NaiveTime) -> Booking {
        Booking {
            appointment_id: Ulid::new(),
            range: TimeRange::new(start, end),
        }
    }

    #[test]
    fn range_basics() {
        let r = TimeRange::new(t(10, 0), t(10, 30));
        assert_eq!(r.duration_minutes(), 30);
        assert!(r.overlaps(&TimeRange::new(t(10, 15), t(11, 0))));
        assert!(!r.overlaps(&TimeRange::new(t(10, 30), t(11, 0)))); // touching
    }

    #[test]
    fn ledger_keeps_start_order() {
        let mut ledger = DayLedger::new(key());
        ledger.insert(booking(t(14, 0), t(15, 0)));
        ledger.insert(booking(t(9, 0), t(10, 0)));
        ledger.insert(booking(t(11, 0), t(12, 0)));
        let starts: Vec<_> = ledger.bookings.iter().map(|b| b.range.start).collect();
        assert_eq!(starts, vec![t(9, 0), t(11, 0), t(14, 0)]);
    }

    #[test]
    fn ledger_remove_by_appointment() {
        let mut ledger = DayLedger::new(key());
        let keep = booking(t(9, 0), t(10, 0));
        let drop = booking(t(10, 0), t(11, 0));
        ledger.insert(keep);
        ledger.insert(drop);

        assert_eq!(ledger.remove(drop.appointment_id), Some(drop));
        assert_eq!(ledger.bookings, vec![keep]);
        assert!(ledger.remove(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_touching_neighbours() {
        let mut ledger = DayLedger::new(key());
        ledger.insert(booking(t(9, 0), t(10, 0)));
        ledger.insert(booking(t(10, 30), t(11, 30)));
        ledger.insert(booking(t(12, 0), t(13, 0)));

        let query = TimeRange::new(t(10, 0), t(12, 0));
        let hits: Vec<_> = ledger.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range.start, t(10, 30));
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let mut ledger = DayLedger::new(key());
        ledger.insert(booking(t(9, 0), t(18, 0)));
        let query = TimeRange::new(t(12, 0), t(12, 30));
        assert_eq!(ledger.overlapping(&query).count(), 1);
    }

    #[test]
    fn cancelled_does_not_hold_slot() {
        assert!(AppointmentStatus::Confirmed.holds_slot());
        assert!(AppointmentStatus::Completed.holds_slot());
        assert!(!AppointmentStatus::Cancelled.holds_slot());
    }

    #[test]
    fn event_survives_bincode() {
        let appointment = Appointment {
            id: Ulid::new(),
            user_id: 7,
            service_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            range: TimeRange::new(t(10, 0), t(10, 30)),
            status: AppointmentStatus::Confirmed,
            cancellation_reason: None,
            created_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            modified_at: None,
        };
        let event = Event::AppointmentBooked { appointment };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
