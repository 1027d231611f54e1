//! Notification sink trait and implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::model::UserId;

/// Something a user should hear about outside the request/response path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Notification {
    /// The user's session ran out of time.
    TimerExpired { session_id: Uuid, user_id: UserId },

    /// The user's remaining time dropped to the warning threshold.
    LowTimeWarning {
        session_id: Uuid,
        user_id: UserId,
        seconds_left: u64,
    },

    /// Credits arrived from another user.
    CreditGift {
        from: UserId,
        to: UserId,
        credits: u64,
    },

    /// The partner ended, skipped, blocked or reported.
    PartnerLeft {
        session_id: Uuid,
        user_id: UserId,
        reason: String,
    },
}

impl Notification {
    /// The user the notification is addressed to.
    pub fn recipient(&self) -> &str {
        match self {
            Notification::TimerExpired { user_id, .. }
            | Notification::LowTimeWarning { user_id, .. }
            | Notification::PartnerLeft { user_id, .. } => user_id,
            Notification::CreditGift { to, .. } => to,
        }
    }
}

/// Trait for delivering notifications.
///
/// Abstracted to support different transports (push, websockets, tests).
/// Delivery is best-effort: the engine logs failures and carries on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification.
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// A sink that discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoOpSink;

#[async_trait]
impl NotificationSink for NoOpSink {
    async fn notify(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// A sink that logs every notification.
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        tracing::info!("Notify {}: {:?}", notification.recipient(), notification);
        Ok(())
    }
}

/// Deliver without failing the caller; delivery errors are logged.
pub(crate) async fn deliver(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.notify(&notification).await {
        warn!("Failed to notify {}: {}", notification.recipient(), e);
    }
}

/// Sink that keeps everything it receives.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    received: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.received.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient() {
        let gift = Notification::CreditGift {
            from: "alice".to_string(),
            to: "bob".to_string(),
            credits: 3,
        };
        assert_eq!(gift.recipient(), "bob");

        let warning = Notification::LowTimeWarning {
            session_id: Uuid::new_v4(),
            user_id: "carol".to_string(),
            seconds_left: 180,
        };
        assert_eq!(warning.recipient(), "carol");
    }

    #[tokio::test]
    async fn test_sinks() {
        let expired = Notification::TimerExpired {
            session_id: Uuid::new_v4(),
            user_id: "alice".to_string(),
        };

        // Should not error
        NoOpSink.notify(&expired).await.unwrap();
        LoggingSink.notify(&expired).await.unwrap();
    }
}
