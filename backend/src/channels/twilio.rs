use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use super::{Channel, ChannelError, ChannelSender, ProviderReceipt};
use crate::config::TwilioConfig;

/// Twilio-backed WhatsApp and SMS channel.
pub struct TwilioSender {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    whatsapp_from: String,
    sms_from: String,
    base_url: String,
    default_phone_prefix: String,
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorResponse {
    message: String,
}

impl TwilioSender {
    pub fn new(config: &TwilioConfig, default_phone_prefix: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            whatsapp_from: config.whatsapp_from.clone(),
            sms_from: config.sms_from.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_phone_prefix: default_phone_prefix.to_string(),
        }
    }

    /// Bare national numbers get the default country prefix; leading zeroes
    /// are dropped in the process.
    fn normalize_phone(&self, phone: &str) -> String {
        let trimmed = phone.trim();
        if trimmed.starts_with('+') {
            trimmed.to_string()
        } else {
            format!("{}{}", self.default_phone_prefix, trimmed.trim_start_matches('0'))
        }
    }
}

#[async_trait]
impl ChannelSender for TwilioSender {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        _subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, ChannelError> {
        if recipient.trim().is_empty() {
            return Err(ChannelError::InvalidRecipient(recipient.to_string()));
        }

        let to_number = self.normalize_phone(recipient);
        let (from, to) = match channel {
            Channel::Whatsapp => (
                format!("whatsapp:{}", self.whatsapp_from),
                format!("whatsapp:{}", to_number),
            ),
            Channel::Sms => (self.sms_from.clone(), to_number),
            Channel::Email => return Err(ChannelError::NotConfigured(channel)),
        };

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("From", from.as_str()), ("To", to.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        if response.status().is_success() {
            let message: TwilioMessageResponse = response
                .json()
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))?;

            info!("{} sent via Twilio: {}", channel, message.sid);

            Ok(ProviderReceipt {
                provider: "twilio".to_string(),
                message_id: message.sid,
                status: message.status,
            })
        } else {
            let status = response.status();
            let detail = response
                .json::<TwilioErrorResponse>()
                .await
                .map(|e| e.message)
                .unwrap_or_else(|_| status.to_string());

            error!("Twilio rejected {} to {}: {}", channel, to, detail);
            Err(ChannelError::Provider(detail))
        }
    }
}
