// =============================================================================
// Alert delivery — webhook POST and optional Telegram notification
// =============================================================================
//
// Called from the synchronous strategy-step thread, so the blocking reqwest
// client is used. Delivery failures are logged and swallowed: alerts must
// never disturb the bar pipeline.
// =============================================================================

use serde::Deserialize;
use tracing::{info, warn};

/// Resolved alert sink for one run. Built from the `[webhook]` config
/// section plus the `BOT_TOKEN` / `CHAT_ID` environment variables.
#[derive(Debug, Clone, Default)]
pub struct AlertSink {
    pub webhook_enabled: bool,
    pub webhook_url: String,
    pub telegram_enabled: bool,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl AlertSink {
    pub fn from_config(webhook: &crate::config::WebhookSection) -> Self {
        Self {
            webhook_enabled: webhook.enabled && !webhook.url.is_empty(),
            webhook_url: webhook.url.clone(),
            telegram_enabled: webhook.telegram_notification,
            telegram_token: std::env::var("BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("CHAT_ID").ok(),
        }
    }

    /// Deliver one alert. `message` is the strategy's alert payload; when it
    /// is a JSON object with a `message` field, that field becomes the
    /// webhook body, mirroring the alert convention of the scripts.
    pub fn send(&self, script_title: &str, message: &str) {
        if !self.webhook_enabled && !self.telegram_enabled {
            return;
        }

        let body = extract_alert_message(message);

        if self.webhook_enabled {
            self.send_webhook(&body);
        }
        if self.telegram_enabled {
            self.send_telegram(script_title, &body);
        }
    }

    fn send_webhook(&self, body: &serde_json::Value) {
        let client = match reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build webhook client");
                return;
            }
        };
        match client.post(&self.webhook_url).json(body).send() {
            Ok(resp) if resp.status().is_success() => {
                info!(status = %resp.status(), "webhook delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "webhook rejected");
            }
            Err(e) => {
                warn!(error = %e, "webhook delivery failed");
            }
        }
    }

    fn send_telegram(&self, script_title: &str, body: &serde_json::Value) {
        let (Some(token), Some(chat_id)) = (&self.telegram_token, &self.telegram_chat_id) else {
            warn!("telegram notification enabled but BOT_TOKEN/CHAT_ID missing");
            return;
        };
        let client = match reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build telegram client");
                return;
            }
        };
        let text = format!("🚨 [{script_title}] {}", body.to_string().replace('"', ""));
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        match client
            .get(&url)
            .query(&[("chat_id", chat_id.as_str()), ("text", text.as_str())])
            .send()
        {
            Ok(resp) if resp.status().is_success() => {
                info!("telegram notification delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram notification rejected");
            }
            Err(e) => {
                warn!(error = %e, "telegram notification failed");
            }
        }
    }
}

#[derive(Deserialize)]
struct AlertEnvelope {
    message: serde_json::Value,
}

/// Pull the `message` field out of a JSON alert payload; non-JSON alerts are
/// delivered as plain strings.
fn extract_alert_message(message: &str) -> serde_json::Value {
    match serde_json::from_str::<AlertEnvelope>(message) {
        Ok(envelope) => envelope.message,
        Err(_) => serde_json::Value::String(message.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_envelope_is_unwrapped() {
        let v = extract_alert_message(r#"{"message": {"signal": "Long 1", "price": 42.0}}"#);
        assert_eq!(v["signal"], "Long 1");
    }

    #[test]
    fn plain_text_passes_through() {
        let v = extract_alert_message("fire!");
        assert_eq!(v, serde_json::Value::String("fire!".into()));
    }

    #[test]
    fn disabled_sink_is_inert() {
        let sink = AlertSink::default();
        // Must not panic or attempt any network call.
        sink.send("Demo", "anything");
    }

    #[test]
    fn sink_from_config_requires_url() {
        let section = crate::config::WebhookSection {
            enabled: true,
            telegram_notification: false,
            url: String::new(),
        };
        let sink = AlertSink::from_config(&section);
        assert!(!sink.webhook_enabled);
    }
}
