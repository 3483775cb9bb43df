use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use futures::future::join_all;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NoticeKind};
use crate::observability::{record_operation, REMINDERS_SENT_TOTAL};

use super::conflict::minutes_until;
use super::{deliver, Engine, EngineError, Entity};

impl Engine {
    /// Snapshot of an appointment owned by `user_id`. Someone else's
    /// appointment is reported as missing.
    pub(super) fn owned_appointment(
        &self,
        appointment_id: &Ulid,
        user_id: UserId,
    ) -> Result<Appointment, EngineError> {
        self.state.appointments
            .get(appointment_id)
            .filter(|a| a.user_id == user_id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(Entity::Appointment, *appointment_id))
    }

    pub fn get_appointment(
        &self,
        appointment_id: &Ulid,
        user_id: UserId,
    ) -> Result<Appointment, EngineError> {
        self.owned_appointment(appointment_id, user_id)
    }

    /// All of a user's appointments regardless of status.
    pub(super) fn appointments_of(&self, user_id: UserId) -> Vec<Appointment> {
        let ids = self
            .state
            .by_owner
            .get(&user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.state.appointments.get(id).map(|a| a.value().clone()))
            .collect()
    }

    /// Confirmed appointments dated today or later, by date then start time.
    pub fn upcoming_appointments(&self, user_id: UserId) -> Vec<Appointment> {
        let today = self.now().date();
        let mut upcoming: Vec<Appointment> = self
            .appointments_of(user_id)
            .into_iter()
            .filter(|a| a.status == AppointmentStatus::Confirmed && a.date >= today)
            .collect();
        upcoming.sort_by_key(|a| (a.date, a.range.start));
        upcoming
    }

    /// Occupied intervals of a service on a date, ascending.
    pub async fn bookings_on(&self, service_id: Ulid, date: NaiveDate) -> Vec<TimeRange> {
        match self.existing_day_ledger(&DayKey::new(service_id, date)) {
            Some(ledger) => ledger.read().await.busy_ranges(),
            None => Vec::new(),
        }
    }

    /// Confirmed appointments starting in `[now, now + window)`, soonest
    /// first. Sweeps one window apart never share an appointment.
    pub(super) fn due_reminders(&self, now: NaiveDateTime) -> Vec<Appointment> {
        let horizon = now + TimeDelta::minutes(i64::from(self.policy.reminder_window_minutes));
        let mut due: Vec<Appointment> = self
            .state
            .appointments
            .iter()
            .filter(|e| {
                let a = e.value();
                a.status == AppointmentStatus::Confirmed
                    && a.starts_at() >= now
                    && a.starts_at() < horizon
            })
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|a| (a.starts_at(), a.id));
        due
    }

    /// Send one reminder per appointment due soon. Sends run concurrently
    /// and each is bounded by a timeout; a failed or stalled send is counted
    /// and does not stop the others.
    pub async fn send_reminders(&self) -> ReminderReport {
        let started = Instant::now();
        let now = self.now();
        let due = self.due_reminders(now);

        let notices: Vec<Notice> = due
            .iter()
            .map(|appointment| {
                let kind = NoticeKind::Reminder {
                    minutes_until: minutes_until(appointment.date, appointment.range.start, now),
                };
                Notice::for_appointment(appointment, kind)
            })
            .collect();
        let sends = notices
            .iter()
            .map(|notice| deliver(self.notifier.as_ref(), notice));
        let outcomes = join_all(sends).await;

        let sent = outcomes.iter().filter(|ok| **ok).count();
        let report = ReminderReport {
            sent,
            failed: outcomes.len() - sent,
        };
        metrics::counter!(REMINDERS_SENT_TOTAL).increment(report.sent as u64);
        record_operation::<ReminderReport>("send_reminders", started, &Ok(report));
        if report.failed > 0 {
            tracing::warn!(
                "reminder sweep: {} sent, {} failed",
                report.sent,
                report.failed
            );
        } else if report.sent > 0 {
            tracing::info!("reminder sweep: {} sent", report.sent);
        }
        report
    }
}
