use async_trait::async_trait;
use lettre::{
    message::Mailbox,
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use super::{Channel, ChannelError, ChannelSender, ProviderReceipt};
use crate::config::SmtpConfig;

/// SMTP-backed email channel.
#[derive(Debug, Clone)]
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl SmtpSender {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, ChannelError> {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(SmtpSender {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        })
    }
}

#[async_trait]
impl ChannelSender for SmtpSender {
    async fn send(
        &self,
        _channel: Channel,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, ChannelError> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let to = recipient
            .parse::<Mailbox>()
            .map_err(|_| ChannelError::InvalidRecipient(recipient.to_string()))?;

        // Stamp our own Message-ID so the delivery record can reference it.
        let message_id = format!("<{}@nurture>", Uuid::new_v4());

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject.unwrap_or("Property inquiry follow-up"))
            .message_id(Some(message_id.clone()))
            .body(body.to_string())
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        match self.transport.send(message).await {
            Ok(response) => {
                info!("Email sent to {}", recipient);
                Ok(ProviderReceipt {
                    provider: "smtp".to_string(),
                    message_id,
                    status: if response.is_positive() { "sent" } else { "queued" }.to_string(),
                })
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", recipient, e);
                Err(ChannelError::Provider(e.to_string()))
            }
        }
    }
}
