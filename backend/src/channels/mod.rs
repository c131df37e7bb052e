// Outbound Channels
//
// Abstract send contract implemented by the messaging collaborators
// (SMTP email, Twilio WhatsApp/SMS). The workflow engine only ever talks
// to the `ChannelSender` trait.

pub mod email;
pub mod twilio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use email::SmtpSender;
pub use twilio::TwilioSender;

/// Outbound message channels supported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider acknowledgement for a single outbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub provider: String,
    pub message_id: String,
    pub status: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is not configured")]
    NotConfigured(Channel),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("provider rejected the message: {0}")]
    Provider(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// The send contract every channel collaborator fulfils.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, ChannelError>;
}

/// Routes a send to the configured provider for the requested channel.
///
/// Unconfigured channels fail with `NotConfigured`, which the dispatcher
/// records as an action failure rather than a crash.
pub struct ChannelRouter {
    email: Option<SmtpSender>,
    twilio: Option<TwilioSender>,
}

impl ChannelRouter {
    pub fn new(email: Option<SmtpSender>, twilio: Option<TwilioSender>) -> Self {
        Self { email, twilio }
    }
}

#[async_trait]
impl ChannelSender for ChannelRouter {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, ChannelError> {
        match channel {
            Channel::Email => match &self.email {
                Some(sender) => sender.send(channel, recipient, subject, body).await,
                None => Err(ChannelError::NotConfigured(channel)),
            },
            Channel::Whatsapp | Channel::Sms => match &self.twilio {
                Some(sender) => sender.send(channel, recipient, subject, body).await,
                None => Err(ChannelError::NotConfigured(channel)),
            },
        }
    }
}
