//! Outbound SMS transport. The live variant POSTs to the provider's
//! `sms_messages` endpoint; a send counts as delivered only when the HTTP
//! status is 200 and the response body reports `status: 200`.

use serde::Deserialize;

use crate::config::SmsSettings;

/// Result of one provider attempt.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
    pub raw_response: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMS provider is not configured")]
    Disabled,
    #[error("SMS provider request failed: {0}")]
    Transport(String),
    #[error("SMS provider rejected the message: {0}")]
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    status: Option<i64>,
    message_id: Option<serde_json::Value>,
}

/// SMS transport. Not a trait: the set of transports is closed and the
/// recording variant keeps tests free of HTTP.
pub enum SmsTransport {
    Http { settings: SmsSettings, client: reqwest::Client },
    Disabled,
    /// Records (phone, body) pairs and reports success.
    Recording(std::sync::Mutex<Vec<(String, String)>>),
}

impl SmsTransport {
    pub fn from_settings(settings: Option<SmsSettings>) -> Self {
        match settings {
            Some(settings) => SmsTransport::Http {
                settings,
                client: reqwest::Client::new(),
            },
            None => SmsTransport::Disabled,
        }
    }

    pub fn recording() -> Self {
        SmsTransport::Recording(std::sync::Mutex::new(Vec::new()))
    }

    /// Messages captured by a recording transport.
    pub fn recorded(&self) -> Vec<(String, String)> {
        match self {
            SmsTransport::Recording(log) => log.lock().map(|l| l.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub async fn deliver(
        &self,
        phone: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        match self {
            SmsTransport::Disabled => Err(DeliveryError::Disabled),
            SmsTransport::Recording(log) => {
                if let Ok(mut log) = log.lock() {
                    log.push((phone.to_string(), body.to_string()));
                }
                Ok(DeliveryReceipt {
                    message_id: Some(format!("test-{phone}")),
                    raw_response: "recorded".into(),
                })
            }
            SmsTransport::Http { settings, client } => {
                let url = format!(
                    "{}/api/v1/sms_messages",
                    settings.base_url.trim_end_matches('/')
                );
                let response = client
                    .post(&url)
                    .json(&serde_json::json!({
                        "api_token": settings.api_token,
                        "phone_number": phone,
                        "message": body,
                    }))
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Transport(e.to_string()))?;

                let http_status = response.status();
                let raw = response
                    .text()
                    .await
                    .map_err(|e| DeliveryError::Transport(e.to_string()))?;

                if !http_status.is_success() {
                    return Err(DeliveryError::Rejected(raw));
                }
                let parsed: ProviderResponse =
                    serde_json::from_str(&raw).unwrap_or(ProviderResponse {
                        status: None,
                        message_id: None,
                    });
                if parsed.status != Some(200) {
                    return Err(DeliveryError::Rejected(raw));
                }
                Ok(DeliveryReceipt {
                    message_id: parsed.message_id.map(|v| match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    }),
                    raw_response: raw,
                })
            }
        }
    }
}
