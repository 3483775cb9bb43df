//! Review drafts: rating first, then optional photos, then a comment or an
//! explicit finalize. Drafts are transient and expire after a TTL; only the
//! finished review is journaled.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::{
    validate_comment, validate_photo, validate_rating, Engine, EngineError, ReviewSubmission,
};
use crate::limits::MAX_OPEN_DRAFTS;
use crate::model::{Appointment, PhotoRef, PhotoSlot, Review, SessionKey, UserId};
use crate::observability::DRAFTS_OPEN;

/// Stored when the client finishes without writing anything.
pub const DEFAULT_COMMENT: &str = "No comment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewDraft {
    pub user_id: UserId,
    pub appointment_id: Ulid,
    pub rating: u8,
    pub photo_before: Option<PhotoRef>,
    pub photo_after: Option<PhotoRef>,
    touched: Instant,
}

pub struct ReviewDesk {
    engine: Arc<Engine>,
    drafts: DashMap<SessionKey, ReviewDraft>,
    /// Held around every insert so the open-draft cap is exact.
    admission: Mutex<()>,
    ttl: Duration,
}

impl ReviewDesk {
    pub fn new(engine: Arc<Engine>, ttl: Duration) -> Self {
        Self {
            engine,
            drafts: DashMap::new(),
            admission: Mutex::new(()),
            ttl,
        }
    }

    fn expired(&self, draft: &ReviewDraft) -> bool {
        draft.touched.elapsed() >= self.ttl
    }

    /// Insert under the cap. Replacing a session's own draft always fits.
    fn admit(&self, session: SessionKey, draft: ReviewDraft) -> Result<(), EngineError> {
        let _admit = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        if self.drafts.len() >= MAX_OPEN_DRAFTS && !self.drafts.contains_key(&session) {
            self.purge_expired();
            if self.drafts.len() >= MAX_OPEN_DRAFTS {
                return Err(EngineError::LimitExceeded("too many open review drafts"));
            }
        }
        self.drafts.insert(session, draft);
        self.update_gauge();
        Ok(())
    }

    fn update_gauge(&self) {
        metrics::gauge!(DRAFTS_OPEN).set(self.drafts.len() as f64);
    }

    pub fn eligible_appointments(&self, user_id: UserId) -> Vec<Appointment> {
        self.engine.eligible_for_review(user_id)
    }

    /// Open a draft for `session`, replacing whatever draft it had.
    pub fn start_draft(
        &self,
        session: SessionKey,
        user_id: UserId,
        appointment_id: Ulid,
        rating: u8,
    ) -> Result<(), EngineError> {
        validate_rating(rating)?;
        self.engine.check_review_eligible(&appointment_id, user_id)?;

        self.admit(
            session,
            ReviewDraft {
                user_id,
                appointment_id,
                rating,
                photo_before: None,
                photo_after: None,
                touched: Instant::now(),
            },
        )?;
        tracing::debug!("session {session}: review draft opened for appointment {appointment_id}");
        Ok(())
    }

    /// Attach a photo token to the session's open draft. A second photo for
    /// the same slot replaces the first.
    pub fn attach_photo(
        &self,
        session: SessionKey,
        slot: PhotoSlot,
        photo: PhotoRef,
    ) -> Result<(), EngineError> {
        validate_photo(&photo)?;

        let mut draft = match self.drafts.get_mut(&session) {
            Some(draft) if !self.expired(&draft) => draft,
            _ => return Err(EngineError::InvalidState("no open review draft")),
        };
        match slot {
            PhotoSlot::Before => draft.photo_before = Some(photo),
            PhotoSlot::After => draft.photo_after = Some(photo),
        }
        draft.touched = Instant::now();
        Ok(())
    }

    /// Store the draft with `comment` and close it. A blank comment is
    /// stored as the placeholder.
    pub async fn set_comment(&self, session: SessionKey, comment: &str) -> Result<Review, EngineError> {
        self.complete(session, Some(comment)).await
    }

    /// Store the draft without a comment and close it.
    pub async fn finalize(&self, session: SessionKey) -> Result<Review, EngineError> {
        self.complete(session, None).await
    }

    async fn complete(&self, session: SessionKey, comment: Option<&str>) -> Result<Review, EngineError> {
        let comment = match comment.map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => DEFAULT_COMMENT.to_string(),
        };
        validate_comment(&comment)?;

        let Some((_, draft)) = self.drafts.remove(&session) else {
            return Err(EngineError::InvalidState("no open review draft"));
        };
        self.update_gauge();
        if self.expired(&draft) {
            return Err(EngineError::InvalidState("no open review draft"));
        }

        let submission = ReviewSubmission {
            user_id: draft.user_id,
            appointment_id: draft.appointment_id,
            rating: draft.rating,
            comment,
            photo_before: draft.photo_before.clone(),
            photo_after: draft.photo_after.clone(),
        };
        let result = self.engine.submit_review(submission).await;
        if let Err(e) = &result
            && e.is_retryable()
        {
            // Keep the draft so the client can try again, unless the
            // session has opened a new one meanwhile or the store is full.
            let _admit = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.drafts.contains_key(&session) && self.drafts.len() < MAX_OPEN_DRAFTS {
                self.drafts.insert(
                    session,
                    ReviewDraft {
                        touched: Instant::now(),
                        ..draft
                    },
                );
                self.update_gauge();
            }
        }
        result
    }

    pub fn draft(&self, session: SessionKey) -> Option<ReviewDraft> {
        self.drafts
            .get(&session)
            .filter(|d| !self.expired(d))
            .map(|d| d.value().clone())
    }

    /// Drop drafts idle past the TTL. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.drafts.len();
        self.drafts.retain(|_, draft| draft.touched.elapsed() < self.ttl);
        let purged = before.saturating_sub(self.drafts.len());
        self.update_gauge();
        purged
    }

    pub fn open_drafts(&self) -> usize {
        self.drafts.len()
    }
}
