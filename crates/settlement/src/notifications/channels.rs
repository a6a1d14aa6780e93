//! External channel clients: push broker, transactional email and SMS
//!
//! Each client is built from environment variables; `from_env` returns
//! `None` when the channel is not configured so the dispatcher can skip it.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{SettlementError, SettlementResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC of a push publish body
pub const PUSH_SIGNATURE_HEADER: &str = "X-Broker-Signature";

/// Channel-scoped publish to a realtime broker
#[async_trait]
pub trait PushBroker: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> SettlementResult<()>;
}

#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> SettlementResult<()>;
}

#[async_trait]
pub trait SmsClient: Send + Sync {
    async fn send(&self, to_phone: &str, body: &str) -> SettlementResult<()>;
}

/// Private per-user channel name on the broker
pub fn user_channel(user_id: uuid::Uuid) -> String {
    format!("private-user-{}", user_id)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

async fn check_response(response: reqwest::Response, provider: &str) -> SettlementResult<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let error_body = response.text().await.unwrap_or_default();
    tracing::error!(
        provider = provider,
        status = %status,
        error_body = %error_body,
        "Channel provider rejected request"
    );
    Err(SettlementError::Channel(format!(
        "{} error ({}): {}",
        provider, status, error_body
    )))
}

/// Publishes JSON to an HTTP broker endpoint, signed with a shared secret
#[derive(Clone)]
pub struct HttpPushBroker {
    http: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl HttpPushBroker {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            secret: secret.into(),
        }
    }

    /// Reads PUSH_BROKER_URL and PUSH_BROKER_SECRET
    pub fn from_env() -> Option<Self> {
        let endpoint = env_non_empty("PUSH_BROKER_URL")?;
        let secret = env_non_empty("PUSH_BROKER_SECRET")?;
        Some(Self::new(endpoint, secret))
    }

    fn sign(&self, body: &[u8]) -> SettlementResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| SettlementError::Config(format!("Invalid push broker secret: {}", e)))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl PushBroker for HttpPushBroker {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> SettlementResult<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "channel": channel,
            "event": event,
            "data": payload,
        }))?;
        let signature = self.sign(&body)?;

        let response = self
            .http
            .post(format!("{}/publish", self.endpoint.trim_end_matches('/')))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(PUSH_SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| SettlementError::Channel(format!("Push broker unreachable: {}", e)))?;

        check_response(response, "push broker").await
    }
}

/// Resend transactional email API
#[derive(Clone)]
pub struct ResendEmailClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl ResendEmailClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.resend.com";

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Reads RESEND_API_KEY, EMAIL_FROM and optionally RESEND_BASE_URL
    pub fn from_env() -> Option<Self> {
        let api_key = env_non_empty("RESEND_API_KEY")?;
        let from = env_non_empty("EMAIL_FROM")
            .unwrap_or_else(|| "Marketplace <orders@example.com>".to_string());
        let base_url =
            env_non_empty("RESEND_BASE_URL").unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());
        Some(Self::new(base_url, api_key, from))
    }
}

#[async_trait]
impl EmailClient for ResendEmailClient {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> SettlementResult<()> {
        let response = self
            .http
            .post(format!("{}/emails", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "html": html_body,
            }))
            .send()
            .await
            .map_err(|e| SettlementError::Channel(format!("Email provider unreachable: {}", e)))?;

        check_response(response, "resend").await
    }
}

/// Twilio Messages API
#[derive(Clone)]
pub struct TwilioSmsClient {
    http: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSmsClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.twilio.com";

    pub fn new(
        base_url: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
        }
    }

    /// Reads TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_FROM_NUMBER
    pub fn from_env() -> Option<Self> {
        let account_sid = env_non_empty("TWILIO_ACCOUNT_SID")?;
        let auth_token = env_non_empty("TWILIO_AUTH_TOKEN")?;
        let from_number = env_non_empty("TWILIO_FROM_NUMBER")?;
        let base_url =
            env_non_empty("TWILIO_BASE_URL").unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());
        Some(Self::new(base_url, account_sid, auth_token, from_number))
    }
}

#[async_trait]
impl SmsClient for TwilioSmsClient {
    async fn send(&self, to_phone: &str, body: &str) -> SettlementResult<()> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url.trim_end_matches('/'),
            self.account_sid
        );
        let form_params = [
            ("To", to_phone),
            ("From", self.from_number.as_str()),
            ("Body", body),
        ];

        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form_params)
            .send()
            .await
            .map_err(|e| SettlementError::Channel(format!("SMS provider unreachable: {}", e)))?;

        check_response(response, "twilio").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_resend_posts_bearer_authenticated_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "to": ["buyer@example.com"],
                "subject": "Order placed",
            })))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let client = ResendEmailClient::new(server.url(), "re_test", "shop@example.com");
        let result = client
            .send("buyer@example.com", "Order placed", "<p>Thanks</p>")
            .await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resend_error_status_is_channel_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid to"}"#)
            .create_async()
            .await;

        let client = ResendEmailClient::new(server.url(), "re_test", "shop@example.com");
        let err = client.send("nope", "s", "b").await.unwrap_err();
        assert!(matches!(err, SettlementError::Channel(msg) if msg.contains("422")));
    }

    #[tokio::test]
    async fn test_twilio_posts_form_with_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("To".into(), "+4915112345678".into()),
                Matcher::UrlEncoded("From".into(), "+15005550006".into()),
                Matcher::UrlEncoded("Body".into(), "Order ready".into()),
            ]))
            .with_status(201)
            .create_async()
            .await;

        let client = TwilioSmsClient::new(server.url(), "AC123", "token", "+15005550006");
        assert!(client.send("+4915112345678", "Order ready").await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_broker_signs_body() {
        let mut server = mockito::Server::new_async().await;
        let broker = HttpPushBroker::new(server.url(), "whsec_push");

        let payload = serde_json::json!({"title": "hi"});
        let expected_body = serde_json::to_vec(&serde_json::json!({
            "channel": "private-user-1",
            "event": "notification",
            "data": payload,
        }))
        .unwrap();
        let expected_signature = broker.sign(&expected_body).unwrap();

        let mock = server
            .mock("POST", "/publish")
            .match_header(PUSH_SIGNATURE_HEADER, expected_signature.as_str())
            .with_status(200)
            .create_async()
            .await;

        broker
            .publish("private-user-1", "notification", &payload)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_user_channel_is_private() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            user_channel(id),
            "private-user-00000000-0000-0000-0000-000000000000"
        );
    }
}
