use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::broadcast;
use ulid::Ulid;

use slotbook::clock::{Clock, ManualClock};
use slotbook::config::Policy;
use slotbook::engine::{Engine, EngineError};
use slotbook::model::*;
use slotbook::notify::{Notice, NoticeKind, NotifyHub};
use slotbook::review::{DEFAULT_COMMENT, ReviewDesk};

// ── Test infrastructure ──────────────────────────────────────

fn data_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    date.and_time(t(h, m))
}

struct Harness {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    clock: Arc<ManualClock>,
    wal: PathBuf,
}

impl Harness {
    fn open(wal: PathBuf, now: NaiveDateTime) -> Self {
        let hub = Arc::new(NotifyHub::new());
        let clock = Arc::new(ManualClock::new(now));
        let engine = Engine::open(wal.clone(), hub.clone(), clock.clone(), Policy::default()).unwrap();
        Self {
            engine: Arc::new(engine),
            hub,
            clock,
            wal,
        }
    }

    fn reopen(self) -> Self {
        let now = self.clock.now();
        let wal = self.wal.clone();
        drop(self);
        Self::open(wal, now)
    }
}

async fn next_notice(rx: &mut broadcast::Receiver<Notice>) -> Notice {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for notice")
        .expect("notice channel closed")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn client_books_moves_and_cancels() {
    let h = Harness::open(data_dir().join("flow.wal"), at(d(2024, 5, 30), 18, 0));
    let mut inbox = h.hub.subscribe(1);

    let category = h
        .engine
        .create_category("Washing".into(), None)
        .await
        .unwrap();
    let wash = h
        .engine
        .create_service(NewService {
            name: "Express wash".into(),
            description: Some("Exterior only".into()),
            price: 500,
            duration_minutes: 30,
            category_id: Some(category.id),
        })
        .await
        .unwrap();

    let offered = h.engine.available_time_slots(wash.id, d(2024, 6, 1)).await.unwrap();
    assert_eq!(&offered[..3], &[t(9, 0), t(9, 45), t(10, 30)]);

    let booked = h
        .engine
        .create_appointment(1, wash.id, d(2024, 6, 1), offered[1])
        .await
        .unwrap();
    assert_eq!(next_notice(&mut inbox).await.kind, NoticeKind::Confirmation);
    assert!(!h.engine.available_time_slots(wash.id, d(2024, 6, 1)).await.unwrap().contains(&t(9, 45)));

    h.engine
        .reschedule_appointment(booked.id, 1, d(2024, 6, 2), t(16, 0))
        .await
        .unwrap();
    assert_eq!(
        next_notice(&mut inbox).await.kind,
        NoticeKind::Rescheduled {
            new_date: d(2024, 6, 2),
            new_start: t(16, 0),
            new_end: t(16, 30),
        }
    );
    assert_eq!(h.engine.upcoming_appointments(1).len(), 1);

    h.engine
        .cancel_appointment(booked.id, 1, Some("plans changed".into()))
        .await
        .unwrap();
    let cancelled = next_notice(&mut inbox).await;
    assert_eq!(cancelled.date, d(2024, 6, 2));
    assert_eq!(
        cancelled.kind,
        NoticeKind::Cancelled {
            reason: Some("plans changed".into())
        }
    );
    assert!(h.engine.upcoming_appointments(1).is_empty());
    assert!(matches!(
        h.engine.cancel_appointment(booked.id, 1, None).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn reminder_sweep_reaches_subscribers() {
    let h = Harness::open(data_dir().join("reminders.wal"), at(d(2024, 6, 1), 7, 0));
    let mut inbox = h.hub.subscribe(4);
    let s = h
        .engine
        .create_service(NewService {
            name: "Tyre change".into(),
            price: 2500,
            duration_minutes: 45,
            ..Default::default()
        })
        .await
        .unwrap();
    let a = h
        .engine
        .create_appointment(4, s.id, d(2024, 6, 1), t(10, 0))
        .await
        .unwrap();
    next_notice(&mut inbox).await;

    // Too early: three hours out.
    assert_eq!(h.engine.send_reminders().await, ReminderReport::default());

    h.clock.set(at(d(2024, 6, 1), 8, 45));
    let report = h.engine.send_reminders().await;
    assert_eq!(report, ReminderReport { sent: 1, failed: 0 });
    let reminder = next_notice(&mut inbox).await;
    assert_eq!(reminder.appointment_id, a.id);
    assert_eq!(reminder.kind, NoticeKind::Reminder { minutes_until: 75 });
}

#[tokio::test]
async fn review_after_completion_survives_restart() {
    let h = Harness::open(data_dir().join("review.wal"), at(d(2024, 6, 1), 8, 0));
    let s = h
        .engine
        .create_service(NewService {
            name: "Headlight restore".into(),
            price: 1500,
            duration_minutes: 60,
            ..Default::default()
        })
        .await
        .unwrap();
    let a = h
        .engine
        .create_appointment(9, s.id, d(2024, 6, 1), t(12, 0))
        .await
        .unwrap();

    let desk = ReviewDesk::new(h.engine.clone(), Duration::from_secs(1800));
    assert!(matches!(
        desk.start_draft(500, 9, a.id, 5),
        Err(EngineError::InvalidState(_))
    ));

    h.engine.mark_completed(a.id).await.unwrap();
    assert_eq!(desk.eligible_appointments(9).len(), 1);
    desk.start_draft(500, 9, a.id, 5).unwrap();
    desk.attach_photo(500, PhotoSlot::After, PhotoRef::new("photos/after.jpg"))
        .unwrap();
    let review = desk.finalize(500).await.unwrap();
    assert_eq!(review.comment, DEFAULT_COMMENT);
    drop(desk);

    let h = h.reopen();
    assert_eq!(h.engine.review_for_appointment(&a.id), Some(review));
    assert_eq!(
        h.engine.get_appointment(&a.id, 9).unwrap().status,
        AppointmentStatus::Completed
    );
    // The completed appointment still holds its slot after replay.
    assert!(!h
        .engine
        .is_time_slot_available(s.id, d(2024, 6, 1), t(12, 30), 30)
        .await
        .unwrap());
    let desk = ReviewDesk::new(h.engine.clone(), Duration::from_secs(1800));
    assert!(desk.eligible_appointments(9).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_day_keeps_bookings_disjoint() {
    let h = Harness::open(data_dir().join("contended.wal"), at(d(2024, 5, 1), 9, 0));
    let service_id = h
        .engine
        .create_service(NewService {
            name: "Full valet".into(),
            price: 8000,
            duration_minutes: 90,
            ..Default::default()
        })
        .await
        .unwrap()
        .id;
    let date = d(2024, 6, 1);

    let mut handles = Vec::new();
    for user in 0..24u64 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            let slots = engine.available_time_slots(service_id, date).await.unwrap();
            for start in slots {
                match engine.create_appointment(user, service_id, date, start).await {
                    Ok(a) => return Some(a),
                    Err(EngineError::Conflict { .. }) => continue,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            None
        }));
    }

    let mut booked = Vec::new();
    for handle in handles {
        if let Some(a) = handle.await.unwrap() {
            booked.push(a);
        }
    }
    assert!(!booked.is_empty());

    let ranges = h.engine.bookings_on(service_id, date).await;
    assert_eq!(ranges.len(), booked.len());
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
        assert!(a.end <= t(21, 0));
    }

    let h = h.reopen();
    assert_eq!(h.engine.bookings_on(service_id, date).await, ranges);
}
