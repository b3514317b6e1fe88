//! Resend HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::delivery::provider::{EmailProvider, OutboundEmail, SendReceipt};
use crate::error::ProviderError;

pub const PROVIDER_NAME: &str = "resend";

/// Sends through `POST {base_url}/emails`.
pub struct ResendClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    from: String,
    list_unsubscribe: Option<String>,
}

impl ResendClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ProviderError::network)?;

        Ok(Self {
            http,
            endpoint: format!("{}/emails", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            from: config.from_header(),
            list_unsubscribe: config.list_unsubscribe.clone(),
        })
    }

    fn payload(&self, email: &OutboundEmail) -> Value {
        let mut body = json!({
            "from": self.from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html,
        });
        if let Some(text) = &email.text {
            body["text"] = json!(text);
        }
        if let Some(unsub) = &self.list_unsubscribe {
            body["headers"] = json!({ "List-Unsubscribe": unsub });
        }
        body
    }
}

#[async_trait]
impl EmailProvider for ResendClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, ProviderError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.payload(email))
            .send()
            .await
            .map_err(ProviderError::network)?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let accepted = (200..300).contains(&status);
        let body = match response.text().await {
            Ok(body) => body,
            // The message is already queued; only the id is lost.
            Err(e) if accepted => {
                warn!(to = %email.to, status, error = %e, "Failed to read response body");
                String::new()
            }
            Err(e) => return Err(ProviderError::network(e)),
        };

        if !accepted {
            return Err(ProviderError::from_status(status, &error_detail(&body), retry_after));
        }

        let message_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
        match &message_id {
            Some(id) => debug!(to = %email.to, message_id = %id, "Message accepted"),
            None => warn!(to = %email.to, status, "Message accepted without an id"),
        }

        Ok(SendReceipt {
            status_code: status,
            message_id,
        })
    }
}

/// `Retry-After` in (possibly fractional) seconds.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: f64 = value?.to_str().ok()?.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Prefer the API's `message` field over the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn email(text: Option<&str>) -> OutboundEmail {
        OutboundEmail {
            to: "ada@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
            text: text.map(str::to_string),
        }
    }

    #[test]
    fn payload_shape() {
        let client = ResendClient::new(&ProviderConfig::default()).unwrap();
        let body = client.payload(&email(None));
        assert_eq!(body["from"], "No Reply <noreply@example.com>");
        assert_eq!(body["to"], json!(["ada@example.com"]));
        assert_eq!(body["subject"], "Hello");
        assert!(body.get("text").is_none());
        assert!(body.get("headers").is_none());
    }

    #[test]
    fn payload_with_text_and_unsubscribe_header() {
        let config = ProviderConfig {
            list_unsubscribe: Some("<https://example.com/unsub>".to_string()),
            ..ProviderConfig::default()
        };
        let client = ResendClient::new(&config).unwrap();
        let body = client.payload(&email(Some("Hi")));
        assert_eq!(body["text"], "Hi");
        assert_eq!(
            body["headers"]["List-Unsubscribe"],
            "<https://example.com/unsub>"
        );
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let config = ProviderConfig {
            base_url: "http://localhost:3000/".to_string(),
            ..ProviderConfig::default()
        };
        let client = ResendClient::new(&config).unwrap();
        assert_eq!(client.endpoint, "http://localhost:3000/emails");
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(
            parse_retry_after(Some(&HeaderValue::from_static("2"))),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            parse_retry_after(Some(&HeaderValue::from_static("0.5"))),
            Some(Duration::from_millis(500))
        );
        assert_eq!(parse_retry_after(Some(&HeaderValue::from_static("soon"))), None);
        assert_eq!(parse_retry_after(Some(&HeaderValue::from_static("-1"))), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn error_detail_prefers_message_field() {
        assert_eq!(
            error_detail(r#"{"statusCode":422,"message":"Invalid `to` field"}"#),
            "Invalid `to` field"
        );
        assert_eq!(error_detail("  upstream exploded "), "upstream exploded");
    }
}
