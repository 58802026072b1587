//! Deliver stage: converted document → recipient mailbox.
//!
//! [`SmtpDeliverer`] sends one multipart message per record: a plain-text
//! body plus the converted document as an attachment. The transport is
//! built once per batch and pooled by `lettre`, so concurrent records reuse
//! connections.

use crate::artifact::Artifact;
use crate::config::SmtpConfig;
use crate::error::{BatchError, DeliveryError};
use crate::message::MessageTemplate;
use crate::record::Record;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Sends a converted artifact to one recipient.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, artifact: &Artifact, to: &Mailbox) -> Result<(), DeliveryError>;
}

/// Resolve and validate the record's destination address.
pub fn parse_destination(record: &Record, field: &str) -> Result<Mailbox, DeliveryError> {
    let address = record.get(field).ok_or_else(|| DeliveryError::MissingAddress {
        field: field.to_string(),
    })?;
    address.parse::<Mailbox>().map_err(|e| DeliveryError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// Delivery over an authenticated SMTP relay (STARTTLS).
pub struct SmtpDeliverer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    message: MessageTemplate,
    timeout: Duration,
}

impl std::fmt::Debug for SmtpDeliverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpDeliverer")
            .field("sender", &self.sender.to_string())
            .field("message", &self.message)
            .finish()
    }
}

impl SmtpDeliverer {
    /// Build the transport. Nothing is sent and no connection is opened yet.
    pub fn new(smtp: &SmtpConfig, message: MessageTemplate, timeout: Duration) -> Result<Self, BatchError> {
        let sender = smtp
            .sender()
            .parse::<Mailbox>()
            .map_err(|e| BatchError::DeliveryNotConfigured {
                hint: format!("Sender address '{}' is invalid: {e}", smtp.sender()),
            })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
            .map_err(|e| BatchError::DeliveryNotConfigured {
                hint: format!("SMTP server '{}' is unusable: {e}", smtp.host),
            })?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
            .timeout(Some(timeout))
            .build();

        info!("SMTP delivery via {}:{} as {}", smtp.host, smtp.port, sender);
        Ok(Self {
            transport,
            sender,
            message,
            timeout,
        })
    }

    /// Build from `SMTP_*` environment variables.
    pub fn from_env(message: MessageTemplate, timeout: Duration) -> Result<Self, BatchError> {
        Self::new(&SmtpConfig::from_env()?, message, timeout)
    }

    fn compose(&self, artifact_name: String, bytes: Vec<u8>, content_type: ContentType, to: &Mailbox) -> Result<Message, DeliveryError> {
        let attachment = Attachment::new(artifact_name).body(bytes, content_type);

        Message::builder()
            .from(self.sender.clone())
            .to(to.clone())
            .subject(self.message.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(self.message.body.clone()))
                    .singlepart(attachment),
            )
            .map_err(|e| DeliveryError::Message {
                address: to.email.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Deliverer for SmtpDeliverer {
    async fn deliver(&self, artifact: &Artifact, to: &Mailbox) -> Result<(), DeliveryError> {
        let address = to.email.to_string();
        let name = artifact.name();

        let bytes = artifact.read().await.map_err(|e| DeliveryError::Attachment {
            name: name.clone(),
            reason: e.kind().to_string(),
        })?;
        let message = self.compose(name.clone(), bytes, attachment_type(artifact.path()), to)?;

        match self.transport.send(message).await {
            Ok(response) => {
                debug!("Delivered {} to {} ({})", name, address, response.code());
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(DeliveryError::Rejected {
                address,
                detail: e.to_string(),
            }),
            Err(e) if e.is_timeout() => Err(DeliveryError::Timeout {
                address,
                elapsed_ms: self.timeout.as_millis() as u64,
            }),
            Err(e) => Err(DeliveryError::Transport {
                address,
                detail: e.to_string(),
            }),
        }
    }
}

fn attachment_type(path: &Path) -> ContentType {
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("html" | "htm") => "text/html",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    };
    ContentType::parse(mime).unwrap_or(ContentType::TEXT_PLAIN)
}
