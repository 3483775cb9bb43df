use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;
use crate::observability::record_operation;
use crate::slot;

use super::conflict::service_range;
use super::{Engine, EngineError, Entity};

impl Engine {
    /// True iff `[start, start + duration)` overlaps no booking of
    /// (service, date). Read-only; the service is not required to exist.
    pub async fn is_time_slot_available(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        duration_minutes: u32,
    ) -> Result<bool, EngineError> {
        let started = Instant::now();
        let result = self
            .is_time_slot_available_inner(service_id, date, start, duration_minutes)
            .await;
        record_operation("is_time_slot_available", started, &result);
        result
    }

    async fn is_time_slot_available_inner(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        duration_minutes: u32,
    ) -> Result<bool, EngineError> {
        let range = service_range(start, duration_minutes)?;
        let key = DayKey::new(service_id, date);
        let Some(ledger) = self.existing_day_ledger(&key) else {
            return Ok(true);
        };
        let guard = ledger.read().await;
        let free = guard.overlapping(&range).next().is_none();
        tracing::debug!(
            "slot {date} {}-{} for service {service_id}: {}",
            range.start.format("%H:%M"),
            range.end.format("%H:%M"),
            if free { "free" } else { "taken" }
        );
        Ok(free)
    }

    /// Start times of the open slots of a service on a date, ascending.
    /// An unknown service has none.
    pub async fn available_time_slots(
        &self,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, EngineError> {
        let started = Instant::now();
        let result = self.available_time_slots_inner(service_id, date).await;
        record_operation("available_time_slots", started, &result);
        result
    }

    async fn available_time_slots_inner(
        &self,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, EngineError> {
        let Some(duration) = self.state.services.get(&service_id).map(|s| s.duration_minutes) else {
            tracing::warn!("slot listing for unknown service {service_id}");
            return Ok(Vec::new());
        };
        Ok(self.open_slots(service_id, date, duration).await)
    }

    /// Run the slot walk over the current busy intervals of (service, date).
    async fn open_slots(&self, service_id: Ulid, date: NaiveDate, duration: u32) -> Vec<NaiveTime> {
        let busy = match self.existing_day_ledger(&DayKey::new(service_id, date)) {
            Some(ledger) => ledger.read().await.busy_ranges(),
            None => Vec::new(),
        };
        slot::enumerate_slots(
            self.policy.day_open,
            self.policy.day_close,
            duration,
            self.policy.slot_buffer_minutes,
            &busy,
        )
    }

    /// Price, duration and whether anything is still open on `date`.
    pub async fn service_availability(
        &self,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<ServiceAvailability, EngineError> {
        let service = self
            .state
            .services
            .get(&service_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Service, service_id))?;
        let open = self
            .open_slots(service_id, date, service.duration_minutes)
            .await;
        Ok(ServiceAvailability {
            service_id,
            date,
            is_available: !open.is_empty(),
            open_slots: open.len(),
            price: service.price,
            duration_minutes: service.duration_minutes,
        })
    }
}
