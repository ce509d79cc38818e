//! Outbound notifications: moderator notices, sender replies, list delivery.

use std::sync::Mutex;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::config::SmtpConfig;

/// Sends mail on behalf of the moderation system. Failures are logged by
/// the implementation and never surface to the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a plain-text notice.
    async fn notify(&self, recipient: &str, subject: &str, body: &str);

    /// Hand an accepted message to the list for distribution.
    async fn deliver(&self, list_address: &str, raw: &[u8]);

    /// Forward a copy of a held message.
    async fn forward(&self, recipient: &str, raw: &[u8]);
}

/// Writes every notification to the log. Used when SMTP is not configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) {
        info!(to = %recipient, subject = %subject, bytes = body.len(), "Notification");
    }

    async fn deliver(&self, list_address: &str, raw: &[u8]) {
        info!(list = %list_address, bytes = raw.len(), "Delivered message to list");
    }

    async fn forward(&self, recipient: &str, raw: &[u8]) {
        info!(to = %recipient, bytes = raw.len(), "Forwarded held message");
    }
}

/// Sends notifications through an SMTP relay.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    from_address: String,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&config.host)?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(Self {
            transport,
            from_address: config.from_address.clone(),
        })
    }

    async fn send_raw(&self, recipient: &str, raw: &[u8]) -> Result<(), String> {
        let from: Address = self
            .from_address
            .parse()
            .map_err(|e| format!("Invalid from address: {e}"))?;
        let to: Address = recipient
            .parse()
            .map_err(|e| format!("Invalid to address: {e}"))?;
        let envelope =
            Envelope::new(Some(from), vec![to]).map_err(|e| format!("Invalid envelope: {e}"))?;

        let transport = self.transport.clone();
        let raw = raw.to_vec();
        tokio::task::spawn_blocking(move || transport.send_raw(&envelope, &raw))
            .await
            .map_err(|e| format!("SMTP task failed: {e}"))?
            .map_err(|e| format!("SMTP send failed: {e}"))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) {
        let built = (|| -> Result<Message, String> {
            Message::builder()
                .from(
                    self.from_address
                        .parse()
                        .map_err(|e| format!("Invalid from address: {e}"))?,
                )
                .to(recipient
                    .parse()
                    .map_err(|e| format!("Invalid to address: {e}"))?)
                .subject(subject)
                .body(body.to_string())
                .map_err(|e| format!("Failed to build email: {e}"))
        })();

        let email = match built {
            Ok(email) => email,
            Err(reason) => {
                warn!(to = %recipient, reason = %reason, "Notification not sent");
                return;
            }
        };

        let transport = self.transport.clone();
        match tokio::task::spawn_blocking(move || transport.send(&email)).await {
            Ok(Ok(_)) => info!(to = %recipient, subject = %subject, "Notification sent"),
            Ok(Err(e)) => warn!(to = %recipient, error = %e, "SMTP send failed"),
            Err(e) => warn!(to = %recipient, error = %e, "SMTP task failed"),
        }
    }

    async fn deliver(&self, list_address: &str, raw: &[u8]) {
        match self.send_raw(list_address, raw).await {
            Ok(()) => info!(list = %list_address, "Delivered message to list"),
            Err(reason) => warn!(list = %list_address, reason = %reason, "Delivery failed"),
        }
    }

    async fn forward(&self, recipient: &str, raw: &[u8]) {
        match self.send_raw(recipient, raw).await {
            Ok(()) => info!(to = %recipient, "Forwarded held message"),
            Err(reason) => warn!(to = %recipient, reason = %reason, "Forward failed"),
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Notice {
        to: String,
        subject: String,
        body: String,
    },
    Delivery {
        list: String,
        raw: Vec<u8>,
    },
    Forward {
        to: String,
        raw: Vec<u8>,
    },
}

/// Keeps every notification in memory. Used by tests.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Notices addressed to `to`, as (subject, body) pairs.
    pub fn notices_to(&self, to: &str) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Notice {
                    to: t,
                    subject,
                    body,
                } if t == to => Some((subject, body)),
                _ => None,
            })
            .collect()
    }

    pub fn deliveries(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| matches!(s, Sent::Delivery { .. }))
            .count()
    }

    fn push(&self, entry: Sent) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(entry);
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) {
        self.push(Sent::Notice {
            to: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
    }

    async fn deliver(&self, list_address: &str, raw: &[u8]) {
        self.push(Sent::Delivery {
            list: list_address.to_string(),
            raw: raw.to_vec(),
        });
    }

    async fn forward(&self, recipient: &str, raw: &[u8]) {
        self.push(Sent::Forward {
            to: recipient.to_string(),
            raw: raw.to_vec(),
        });
    }
}
