// Notification outbox
//
// Settlement code only ever enqueues; delivery happens on a separate worker
// so a slow or failing webhook can never hold up or fail a settlement write.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

const OUTBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient_address: String,
    pub title: String,
    pub message: String,
}

/// Sending half of the outbox
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue without waiting; a full or closed outbox drops the message
    pub fn notify(&self, recipient_address: &str, title: &str, message: &str) {
        let notification = Notification {
            recipient_address: recipient_address.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        };
        if let Err(e) = self.tx.try_send(notification) {
            warn!(recipient = %recipient_address, error = %e, "⚠️ Notification dropped");
        }
    }

    /// Notifier whose messages go nowhere
    pub fn disabled() -> Self {
        let (notifier, _) = Self::channel(1);
        notifier
    }
}

// ============ WEBHOOK DELIVERY ============

/// Posts outbox entries as JSON to a webhook
pub struct WebhookDispatcher {
    url: String,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn deliver(&self, notification: &Notification) -> AppResult<()> {
        let response = self.client.post(&self.url).json(notification).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalError(format!(
                "Notification webhook returned {}: {}",
                status, error_text
            )));
        }

        debug!(recipient = %notification.recipient_address, "notification delivered");
        Ok(())
    }
}

/// Start the outbox. Without a webhook the worker just drains and logs.
pub fn spawn_outbox(webhook_url: Option<String>) -> (Notifier, JoinHandle<()>) {
    let (notifier, mut rx) = Notifier::channel(OUTBOX_CAPACITY);
    let dispatcher = webhook_url.map(WebhookDispatcher::new);

    let handle = tokio::spawn(async move {
        info!(webhook = dispatcher.is_some(), "📬 Notification outbox started");
        while let Some(notification) = rx.recv().await {
            match &dispatcher {
                Some(dispatcher) => {
                    if let Err(e) = dispatcher.deliver(&notification).await {
                        warn!(
                            recipient = %notification.recipient_address,
                            error = %e,
                            "⚠️ Notification delivery failed"
                        );
                    }
                }
                None => info!(
                    recipient = %notification.recipient_address,
                    title = %notification.title,
                    "📬 {}",
                    notification.message
                ),
            }
        }
    });

    (notifier, handle)
}
