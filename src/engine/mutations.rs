use std::time::Instant;

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NoticeKind};
use crate::observability::record_operation;

use super::conflict::{check_slot_free, service_range, validate_reason};
use super::{Engine, EngineError, Entity};

fn log_rejection<T>(op: &str, result: &Result<T, EngineError>) {
    if let Err(e) = result {
        tracing::warn!("{op} rejected: {e}");
    }
}

impl Engine {
    /// Book `start` on `date` for the service's full duration.
    ///
    /// The availability check and the commit run under the day's write lock,
    /// so two overlapping requests cannot both succeed.
    pub async fn create_appointment(
        &self,
        user_id: UserId,
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Result<Appointment, EngineError> {
        let started = Instant::now();
        let result = self
            .create_appointment_inner(user_id, service_id, date, start)
            .await;
        record_operation("create_appointment", started, &result);
        log_rejection("create_appointment", &result);

        if let Ok(appointment) = &result {
            self.dispatch(Notice::for_appointment(appointment, NoticeKind::Confirmation));
        }
        result
    }

    async fn create_appointment_inner(
        &self,
        user_id: UserId,
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Result<Appointment, EngineError> {
        let service = self.get_service(&service_id)?;
        let range = service_range(start, service.duration_minutes)?;

        let ledger = self.day_ledger(DayKey::new(service_id, date));
        let guard = ledger.write_owned().await;
        check_slot_free(&guard, &range, None)?;

        let appointment = Appointment {
            id: Ulid::new(),
            user_id,
            service_id,
            date,
            range,
            status: AppointmentStatus::Confirmed,
            cancellation_reason: None,
            created_at: self.now(),
            modified_at: None,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(event, vec![guard]).await?;

        tracing::info!(
            "appointment {} booked: user {user_id}, service {service_id}, {date} {}-{}",
            appointment.id,
            range.start.format("%H:%M"),
            range.end.format("%H:%M")
        );
        Ok(appointment)
    }

    /// Move a confirmed appointment to a new date and start time.
    pub async fn reschedule_appointment(
        &self,
        appointment_id: Ulid,
        user_id: UserId,
        new_date: NaiveDate,
        new_start: NaiveTime,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .reschedule_appointment_inner(appointment_id, user_id, new_date, new_start)
            .await;
        record_operation("reschedule_appointment", started, &result);
        log_rejection("reschedule_appointment", &result);

        match result {
            Ok(moved) => {
                let kind = NoticeKind::Rescheduled {
                    new_date: moved.date,
                    new_start: moved.range.start,
                    new_end: moved.range.end,
                };
                self.dispatch(Notice::for_appointment(&moved, kind));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn reschedule_appointment_inner(
        &self,
        appointment_id: Ulid,
        user_id: UserId,
        new_date: NaiveDate,
        new_start: NaiveTime,
    ) -> Result<Appointment, EngineError> {
        loop {
            let seen = self.owned_appointment(&appointment_id, user_id)?;
            let from = seen.day_key();
            let to = DayKey::new(seen.service_id, new_date);
            let guards = self.lock_days(&[from, to]).await;

            let current = self.owned_appointment(&appointment_id, user_id)?;
            if current.day_key() != from {
                // Moved by a concurrent reschedule while we waited.
                continue;
            }
            if current.status != AppointmentStatus::Confirmed {
                return Err(EngineError::InvalidState(
                    "only confirmed appointments can be rescheduled",
                ));
            }
            let now = self.now();
            let notice = TimeDelta::minutes(i64::from(self.policy.reschedule_notice_minutes));
            if current.starts_at() - now < notice {
                return Err(EngineError::InvalidState(
                    "too close to the appointment to reschedule",
                ));
            }

            let service = self.get_service(&current.service_id)?;
            let range = service_range(new_start, service.duration_minutes)?;
            if let Some(target) = guards.iter().find(|g| g.key == to) {
                check_slot_free(target, &range, Some(appointment_id))?;
            }

            let event = Event::AppointmentRescheduled {
                id: appointment_id,
                date: new_date,
                range,
                modified_at: now,
            };
            self.persist_and_apply(event, guards).await?;

            tracing::info!(
                "appointment {appointment_id} rescheduled: {} {} -> {new_date} {}",
                current.date,
                current.range.start.format("%H:%M"),
                range.start.format("%H:%M")
            );
            return Ok(Appointment {
                date: new_date,
                range,
                modified_at: Some(now),
                ..current
            });
        }
    }

    /// Cancel a confirmed appointment and free its slot. Terminal: a second
    /// cancel fails.
    pub async fn cancel_appointment(
        &self,
        appointment_id: Ulid,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .cancel_appointment_inner(appointment_id, user_id, reason)
            .await;
        record_operation("cancel_appointment", started, &result);
        log_rejection("cancel_appointment", &result);

        match result {
            Ok(cancelled) => {
                let kind = NoticeKind::Cancelled {
                    reason: cancelled.cancellation_reason.clone(),
                };
                self.dispatch(Notice::for_appointment(&cancelled, kind));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_appointment_inner(
        &self,
        appointment_id: Ulid,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_reason(reason.as_deref())?;
        self.owned_appointment(&appointment_id, user_id)?;

        let guard = self.lock_appointment_day(&appointment_id).await?;
        let current = self.owned_appointment(&appointment_id, user_id)?;
        if current.status != AppointmentStatus::Confirmed {
            return Err(EngineError::InvalidState(
                "only confirmed appointments can be cancelled",
            ));
        }

        let now = self.now();
        let event = Event::AppointmentCancelled {
            id: appointment_id,
            reason: reason.clone(),
            modified_at: now,
        };
        self.persist_and_apply(event, vec![guard]).await?;

        tracing::info!("appointment {appointment_id} cancelled by user {user_id}");
        Ok(Appointment {
            status: AppointmentStatus::Cancelled,
            cancellation_reason: reason,
            modified_at: Some(now),
            ..current
        })
    }

    /// Close out a confirmed appointment after it has taken place. Called by
    /// the external completion batch; the slot stays occupied.
    pub async fn mark_completed(&self, appointment_id: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.mark_completed_inner(appointment_id).await;
        record_operation("mark_completed", started, &result);
        log_rejection("mark_completed", &result);
        result
    }

    async fn mark_completed_inner(&self, appointment_id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_appointment_day(&appointment_id).await?;
        let status = self
            .state
            .appointments
            .get(&appointment_id)
            .map(|a| a.status)
            .ok_or(EngineError::NotFound(Entity::Appointment, appointment_id))?;
        if status != AppointmentStatus::Confirmed {
            return Err(EngineError::InvalidState(
                "only confirmed appointments can be completed",
            ));
        }

        let event = Event::AppointmentCompleted {
            id: appointment_id,
            modified_at: self.now(),
        };
        self.persist_and_apply(event, vec![guard]).await?;
        tracing::info!("appointment {appointment_id} completed");
        Ok(())
    }
}
