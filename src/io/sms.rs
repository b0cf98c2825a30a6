//! SMS delivery to the security contact (Twilio Messages API)

use crate::domain::error::AlertError;
use crate::domain::types::Alert;
use crate::infra::config::Config;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01/Accounts";

#[async_trait]
pub trait AlertGateway: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

pub struct TwilioGateway {
    client: reqwest::Client,
    account_sid: String,
    auth_header: String,
    phone_from: String,
    phone_to: String,
    site: String,
}

impl TwilioGateway {
    /// `None` unless all four credentials are configured
    pub fn from_config(config: &Config) -> Option<Self> {
        let (Some(sid), Some(token), Some(from), Some(to)) = (
            config.twilio_account_sid(),
            config.twilio_auth_token(),
            config.phone_from(),
            config.phone_security(),
        ) else {
            return None;
        };

        let credentials = format!("{}:{}", sid, token);
        let auth_header = format!("Basic {}", STANDARD.encode(credentials.as_bytes()));

        Some(Self {
            client: reqwest::Client::new(),
            account_sid: sid.to_string(),
            auth_header,
            phone_from: from.to_string(),
            phone_to: to.to_string(),
            site: config.site_id().to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/Messages.json", TWILIO_API, self.account_sid)
    }
}

#[async_trait]
impl AlertGateway for TwilioGateway {
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let body = alert.message(&self.site);
        let form = [
            ("To", self.phone_to.as_str()),
            ("From", self.phone_from.as_str()),
            ("Body", body.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .header("Authorization", &self.auth_header)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        info!(alert_id = %alert.id, kind = alert.kind.as_str(), status = %status.as_u16(), "sms_sent");
        Ok(())
    }
}

/// Gateway that records deliveries and can fail a number of times first
#[derive(Clone, Default)]
pub struct RecordingGateway {
    delivered: Arc<Mutex<Vec<Alert>>>,
    failures_left: Arc<Mutex<u32>>,
}

impl RecordingGateway {
    pub fn failing(times: u32) -> Self {
        let gateway = Self::default();
        *gateway.failures_left.lock() = times;
        gateway
    }

    pub fn delivered(&self) -> Vec<Alert> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl AlertGateway for RecordingGateway {
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(AlertError::Status(503));
            }
        }
        self.delivered.lock().push(alert.clone());
        Ok(())
    }
}
