use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingRequested,
    QuoteSubmitted,
    QuoteAccepted,
    QuoteRejected,
    RfqReopened,
    StatusChanged,
    PaymentFailed,
    PaymentCaptured,
    Refunded,
    AnswersSubmitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub booking_id: Ulid,
    pub kind: NotificationKind,
    pub status: BookingStatus,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("recipient {0} unreachable")]
    Unreachable(Ulid),
    #[error("notifier closed")]
    Closed,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification, recipient: Ulid) -> Result<(), NotifyError>;
}

/// Broadcast hub keyed by recipient (customer or professional id).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn remove(&self, recipient: &Ulid) {
        self.channels.remove(recipient);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    async fn send(&self, notification: &Notification, recipient: Ulid) -> Result<(), NotifyError> {
        if let Some(sender) = self.channels.get(&recipient) {
            let _ = sender.send(notification.clone());
        }
        Ok(())
    }
}
