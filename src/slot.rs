//! Time-of-day interval arithmetic. Pure functions, no state.

use chrono::{NaiveTime, TimeDelta};

use crate::model::TimeRange;

/// Half-open overlap test for `[start_a, end_a)` and `[start_b, end_b)`.
/// Intervals that only touch (`end_a == start_b`) do not overlap.
pub fn overlaps(start_a: NaiveTime, end_a: NaiveTime, start_b: NaiveTime, end_b: NaiveTime) -> bool {
    start_a < end_b && start_b < end_a
}

/// `start + duration_minutes`, or `None` if the interval would be empty or
/// would run past midnight.
pub fn end_time(start: NaiveTime, duration_minutes: u32) -> Option<NaiveTime> {
    let (end, wrapped) = start.overflowing_add_signed(TimeDelta::minutes(duration_minutes as i64));
    if wrapped != 0 || end <= start {
        return None;
    }
    Some(end)
}

/// The `[start, start + duration)` range, if it fits in the day.
pub fn slot_range(start: NaiveTime, duration_minutes: u32) -> Option<TimeRange> {
    end_time(start, duration_minutes).map(|end| TimeRange::new(start, end))
}

/// Walk the business window and collect every start time at which a slot of
/// `duration_minutes` fits without overlapping `busy`.
///
/// A free candidate is taken and the walk jumps `duration + buffer`; a busy
/// candidate only moves on by `buffer`. Stops once a slot would end after
/// `close`.
pub fn enumerate_slots(
    open: NaiveTime,
    close: NaiveTime,
    duration_minutes: u32,
    buffer_minutes: u32,
    busy: &[TimeRange],
) -> Vec<NaiveTime> {
    let mut slots = Vec::new();
    // A zero step would never leave a busy candidate.
    let retry_step = buffer_minutes.max(1);
    let mut candidate = open;

    loop {
        let Some(end) = end_time(candidate, duration_minutes) else {
            break;
        };
        if end > close {
            break;
        }

        let taken = busy
            .iter()
            .any(|b| overlaps(candidate, end, b.start, b.end));
        let advance = if taken {
            retry_step
        } else {
            slots.push(candidate);
            duration_minutes + buffer_minutes
        };

        match end_time(candidate, advance) {
            Some(next) => candidate = next,
            None => break,
        }
    }

    slots
}
