//! Outbound SMS dispatch via Twilio. Fire-and-forget: callers log failures
//! and move on, there is no retry here.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

const TWILIO_API_BASE: &str = "https://api.twilio.com/";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("SMS provider rejected send ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// SMS-sending capability. `send` returns the provider's delivery reference.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<String, DispatchError>;
}

#[derive(Clone)]
pub struct TwilioClient {
    http: Client,
    base_url: Url,
    messages_url: Url,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl fmt::Debug for TwilioClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioClient")
            .field("base_url", &self.base_url)
            .field("from_number", &self.from_number)
            .finish_non_exhaustive()
    }
}

impl TwilioClient {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        let base_url = Url::parse(TWILIO_API_BASE).expect("valid default Twilio URL");
        Self::with_base_url(account_sid, auth_token, from_number, base_url)
    }

    pub fn with_base_url(
        account_sid: String,
        auth_token: String,
        from_number: String,
        base_url: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent("inbox-relay/0.1")
            .build()
            .expect("reqwest client");
        let messages_url = base_url
            .join(&format!("2010-04-01/Accounts/{}/Messages.json", account_sid))
            .expect("valid Twilio messages URL");
        Self {
            http,
            base_url,
            messages_url,
            account_sid,
            auth_token,
            from_number,
        }
    }
}

#[derive(Deserialize)]
struct SendResponse {
    sid: String,
}

#[async_trait]
impl SmsSender for TwilioClient {
    async fn send(&self, to: &str, body: &str) -> Result<String, DispatchError> {
        let form = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let res = self
            .http
            .post(self.messages_url.clone())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected { status, body });
        }

        let payload: SendResponse = res.json().await?;
        Ok(payload.sid)
    }
}

/// Normalize a stored phone number to E.164 for dispatch: keep an existing
/// `+` prefix, otherwise strip separators and prepend the country code.
pub fn format_e164(phone: &str, country_code: &str) -> String {
    let trimmed = phone.trim();
    if trimmed.starts_with('+') {
        return trimmed.to_string();
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{}{}", country_code, digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_country_code() {
        assert_eq!(format_e164("5551234567", "+1"), "+15551234567");
        assert_eq!(format_e164("555-123-4567", "+1"), "+15551234567");
        assert_eq!(format_e164(" (555) 123 4567 ", "+1"), "+15551234567");
    }

    #[test]
    fn keeps_existing_plus_prefix() {
        assert_eq!(format_e164("+447700900123", "+1"), "+447700900123");
    }
}
