use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::slot;

use super::EngineError;

/// `[start, start + duration)`, rejecting slots that would run past midnight.
pub(crate) fn service_range(start: NaiveTime, duration_minutes: u32) -> Result<TimeRange, EngineError> {
    if duration_minutes == 0 {
        return Err(EngineError::ValidationFailed("duration must be positive".into()));
    }
    slot::slot_range(start, duration_minutes).ok_or_else(|| {
        EngineError::ValidationFailed(format!(
            "{} + {duration_minutes} min runs past midnight",
            start.format("%H:%M")
        ))
    })
}

/// Fail with `Conflict` if any booking in the ledger overlaps `range`.
/// `exclude` skips one appointment's own booking (reschedule).
pub(crate) fn check_slot_free(
    ledger: &DayLedger,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let taken = ledger
        .overlapping(range)
        .any(|b| Some(b.appointment_id) != exclude);
    if taken {
        return Err(EngineError::Conflict {
            service_id: ledger.key.service_id,
            date: ledger.key.date,
            start: range.start,
        });
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::ValidationFailed("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_description(description: Option<&str>) -> Result<(), EngineError> {
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

pub(crate) fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    if minutes == 0 {
        return Err(EngineError::ValidationFailed("duration must be positive".into()));
    }
    if minutes > MAX_SERVICE_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("service duration too long"));
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("cancellation reason too long"));
    }
    Ok(())
}

pub(crate) fn validate_rating(rating: u8) -> Result<(), EngineError> {
    if !(1..=5).contains(&rating) {
        return Err(EngineError::ValidationFailed(format!(
            "rating must be between 1 and 5, got {rating}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_comment(comment: &str) -> Result<(), EngineError> {
    if comment.len() > MAX_COMMENT_LEN {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

pub(crate) fn validate_photo(photo: &PhotoRef) -> Result<(), EngineError> {
    if photo.as_str().is_empty() {
        return Err(EngineError::ValidationFailed("photo reference is empty".into()));
    }
    if photo.as_str().len() > MAX_PHOTO_REF_LEN {
        return Err(EngineError::LimitExceeded("photo reference too long"));
    }
    Ok(())
}

/// Minutes from `now` until the appointment starts; negative once started.
pub(crate) fn minutes_until(date: NaiveDate, start: NaiveTime, now: chrono::NaiveDateTime) -> i64 {
    (date.and_time(start) - now).num_minutes()
}
