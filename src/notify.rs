use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, TimeRange, UserId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    Confirmation,
    Cancelled {
        reason: Option<String>,
    },
    Rescheduled {
        new_date: NaiveDate,
        new_start: NaiveTime,
        new_end: NaiveTime,
    },
    Reminder {
        minutes_until: i64,
    },
}

impl NoticeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NoticeKind::Confirmation => "confirmation",
            NoticeKind::Cancelled { .. } => "cancelled",
            NoticeKind::Rescheduled { .. } => "rescheduled",
            NoticeKind::Reminder { .. } => "reminder",
        }
    }
}

/// A lifecycle event addressed to the appointment's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub appointment_id: Ulid,
    pub user_id: UserId,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    #[serde(flatten)]
    pub kind: NoticeKind,
}

impl Notice {
    pub fn for_appointment(appointment: &Appointment, kind: NoticeKind) -> Self {
        Self {
            appointment_id: appointment.id,
            user_id: appointment.user_id,
            service_id: appointment.service_id,
            date: appointment.date,
            range: appointment.range,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound delivery seam. The engine treats every call as best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Broadcast hub with one channel per user. Chat handlers subscribe for the
/// users they serve and relay what arrives.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a user's channel; outstanding receivers see it close.
    pub fn remove(&self, user_id: &UserId) {
        self.channels.remove(user_id);
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        if let Some(sender) = self.channels.get(&notice.user_id) {
            let _ = sender.send(notice.clone());
        }
        Ok(())
    }
}

/// Writes each notice as a JSON line through `tracing`, for a relay that
/// tails the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        let payload =
            serde_json::to_string(notice).map_err(|e| NotifyError(e.to_string()))?;
        tracing::info!(target: "slotbook::notice", "{payload}");
        Ok(())
    }
}
