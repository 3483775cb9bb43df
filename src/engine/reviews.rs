use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::observability::record_operation;

use super::conflict::{validate_comment, validate_photo, validate_rating};
use super::{Engine, EngineError};

/// A finished review as handed over by the draft workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSubmission {
    pub user_id: UserId,
    pub appointment_id: Ulid,
    pub rating: u8,
    pub comment: String,
    pub photo_before: Option<PhotoRef>,
    pub photo_after: Option<PhotoRef>,
}

impl Engine {
    /// Completed appointments of the user that have no review yet, oldest
    /// first.
    pub fn eligible_for_review(&self, user_id: UserId) -> Vec<Appointment> {
        let mut eligible: Vec<Appointment> = self
            .appointments_of(user_id)
            .into_iter()
            .filter(|a| {
                a.status == AppointmentStatus::Completed && !self.state.reviews.contains_key(&a.id)
            })
            .collect();
        eligible.sort_by_key(|a| (a.date, a.range.start));
        eligible
    }

    /// The appointment, if `user_id` may review it now.
    pub fn check_review_eligible(
        &self,
        appointment_id: &Ulid,
        user_id: UserId,
    ) -> Result<Appointment, EngineError> {
        let appointment = self.owned_appointment(appointment_id, user_id)?;
        if appointment.status != AppointmentStatus::Completed {
            return Err(EngineError::InvalidState("appointment is not completed"));
        }
        if self.state.reviews.contains_key(appointment_id) {
            return Err(EngineError::InvalidState("appointment already reviewed"));
        }
        Ok(appointment)
    }

    /// Persist a review. Eligibility is re-checked under the appointment's
    /// day lock, so only one of two racing submissions lands.
    pub async fn submit_review(&self, submission: ReviewSubmission) -> Result<Review, EngineError> {
        let started = Instant::now();
        let result = self.submit_review_inner(submission).await;
        record_operation("submit_review", started, &result);
        if let Err(e) = &result {
            tracing::warn!("submit_review rejected: {e}");
        }
        result
    }

    async fn submit_review_inner(&self, submission: ReviewSubmission) -> Result<Review, EngineError> {
        validate_rating(submission.rating)?;
        validate_comment(&submission.comment)?;
        for photo in [&submission.photo_before, &submission.photo_after]
            .into_iter()
            .flatten()
        {
            validate_photo(photo)?;
        }
        self.owned_appointment(&submission.appointment_id, submission.user_id)?;

        let guard = self.lock_appointment_day(&submission.appointment_id).await?;
        self.check_review_eligible(&submission.appointment_id, submission.user_id)?;

        let review = Review {
            id: Ulid::new(),
            user_id: submission.user_id,
            appointment_id: submission.appointment_id,
            rating: submission.rating,
            comment: submission.comment,
            photo_before: submission.photo_before,
            photo_after: submission.photo_after,
            created_at: self.now(),
        };
        let event = Event::ReviewSubmitted {
            review: review.clone(),
        };
        self.persist_and_apply(event, vec![guard]).await?;

        tracing::info!(
            "review {} stored for appointment {} ({} stars)",
            review.id,
            review.appointment_id,
            review.rating
        );
        Ok(review)
    }

    pub fn review_for_appointment(&self, appointment_id: &Ulid) -> Option<Review> {
        self.state.reviews.get(appointment_id).map(|r| r.value().clone())
    }
}
