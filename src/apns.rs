use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::alarm::{SoundBand, TriggerId};
use crate::authtoken::AuthToken;
use crate::error::DeliveryError;
use crate::util::get_short_token;

pub const REMINDER_TITLE: &str = "Time to pray!";

/// One firing of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub trigger_id: TriggerId,
    pub band: SoundBand,
}

/// Where fired reminders go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, push_token: &str, reminder: &Reminder) -> Result<(), DeliveryError>;
}

/// Delivers reminders as APNs alert pushes over HTTP/2.
pub struct ApnsSink {
    client: reqwest::Client,
    host: String,
    topic: String,
    auth_token: Arc<RwLock<AuthToken>>,
}

impl ApnsSink {
    pub fn new(host: String, topic: String, auth_token: Arc<RwLock<AuthToken>>) -> Result<ApnsSink, DeliveryError> {
        let client = reqwest::Client::builder().http2_prior_knowledge().build()?;
        Ok(ApnsSink { client, host, topic, auth_token })
    }

    async fn headers(&self, body_len: usize) -> Result<HeaderMap, DeliveryError> {
        let auth = self.auth_token.read().await.token.clone();
        let mut headers = HeaderMap::new();
        headers.insert("apns-topic", HeaderValue::from_str(&self.topic)?);
        headers.insert("apns-push-type", HeaderValue::from_static("alert"));
        headers.insert("apns-priority", HeaderValue::from_static("10"));
        headers.insert("authorization", HeaderValue::from_str(&format!("bearer {auth}"))?);
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_str(&body_len.to_string())?);
        Ok(headers)
    }
}

#[async_trait]
impl NotificationSink for ApnsSink {
    async fn deliver(&self, push_token: &str, reminder: &Reminder) -> Result<(), DeliveryError> {
        let url = format!("https://{}/3/device/{}", self.host, push_token);
        let body = get_apns_body(reminder);
        debug!("apns:: body for ...{}: {body}", get_short_token(push_token));

        let headers = self.headers(body.as_bytes().len()).await?;
        let res = self.client.post(url).headers(headers).body(body).send().await?;

        let status = res.status();
        let apns_id = res
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeliveryError::Rejected { status: status.as_u16(), body: text });
        }
        info!("APNs response: status={}, apns-id={}, {}", status, apns_id, text);
        Ok(())
    }
}

/// Writes reminders to the log instead of pushing them. Used when APNs is not configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, push_token: &str, reminder: &Reminder) -> Result<(), DeliveryError> {
        info!(
            "reminder {} for ...{}: \"{}\" with {} ({})",
            reminder.trigger_id,
            get_short_token(push_token),
            REMINDER_TITLE,
            reminder.band.sound_file(),
            reminder.band.channel_name()
        );
        Ok(())
    }
}

fn get_apns_body(reminder: &Reminder) -> String {
    json!({
        "aps": {
            "alert": {
                "title": REMINDER_TITLE,
            },
            "sound": reminder.band.sound_file(),
            "thread-id": reminder.band.channel_name(),
            "interruption-level": "time-sensitive",
        },
        "triggerId": reminder.trigger_id.as_str(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_band_sound_and_channel() {
        let reminder = Reminder {
            trigger_id: TriggerId::from("t-1"),
            band: SoundBand::Afternoon,
        };
        let body: serde_json::Value = serde_json::from_str(&get_apns_body(&reminder)).unwrap();
        assert_eq!(body["aps"]["alert"]["title"], REMINDER_TITLE);
        assert_eq!(body["aps"]["sound"], "hailmary.m4a");
        assert_eq!(body["aps"]["thread-id"], "Afternoon");
        assert_eq!(body["triggerId"], "t-1");
    }

    #[tokio::test]
    async fn log_sink_always_accepts() {
        let reminder = Reminder {
            trigger_id: TriggerId::from("t-2"),
            band: SoundBand::Morning,
        };
        assert!(LogSink.deliver("0123456789abcdef", &reminder).await.is_ok());
    }
}
