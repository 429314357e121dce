use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{channel, error::TrySendError, Sender};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub buyer_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub metadata: Value,
}

/// key: notification-collaborator -> delivery owned outside the billing core
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the structured log; used when no push transport is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            buyer = %notification.buyer_id,
            kind = %notification.kind,
            title = %notification.title,
            metadata = %notification.metadata,
            "notification emitted"
        );
        Ok(())
    }
}

/// key: notification-handle -> non-blocking enqueue interface
#[derive(Clone)]
pub struct NotificationHandle {
    sender: Sender<Notification>,
}

impl NotificationHandle {
    /// Never blocks and never fails the caller; a full or closed queue drops the
    /// notification with a warning.
    pub fn dispatch(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!(
                buyer = %dropped.buyer_id,
                kind = %dropped.kind,
                "notification queue full; dropping notification"
            ),
            Err(TrySendError::Closed(dropped)) => warn!(
                buyer = %dropped.buyer_id,
                kind = %dropped.kind,
                "notification worker stopped; dropping notification"
            ),
        }
    }
}

pub fn start_notification_worker(notifier: Arc<dyn Notifier>) -> NotificationHandle {
    let (tx, mut rx) = channel::<Notification>(256);
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let buyer_id = notification.buyer_id;
            let kind = notification.kind.clone();
            if let Err(err) = notifier.notify(notification).await {
                error!(?err, buyer = %buyer_id, %kind, "failed to deliver notification");
            }
        }
    });

    NotificationHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    use super::*;

    struct FlakyNotifier {
        delivered: UnboundedSender<String>,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, notification: Notification) -> Result<()> {
            if notification.kind == "broken" {
                return Err(anyhow!("push transport down"));
            }
            let _ = self.delivered.send(notification.title);
            Ok(())
        }
    }

    fn notification(kind: &str, title: &str) -> Notification {
        Notification {
            buyer_id: Uuid::new_v4(),
            kind: kind.into(),
            title: title.into(),
            body: String::new(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn delivery_errors_do_not_stop_the_worker() {
        let (tx, mut rx) = unbounded_channel();
        let handle = start_notification_worker(Arc::new(FlakyNotifier { delivered: tx }));

        handle.dispatch(notification("broken", "lost"));
        handle.dispatch(notification("purchase", "ticket issued"));

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("worker delivered in time");
        assert_eq!(delivered.as_deref(), Some("ticket issued"));
    }
}
