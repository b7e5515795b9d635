use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::gmail::model::{decode_base64url, header_value, plain_text_data};
use crate::gmail::model::{HistoryListResp, MessageResp, WatchResp};

pub mod model;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/";

/// A fetched message reduced to the fields the pipeline cares about. Any of
/// them may be absent; callers decide whether that skips the message.
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    pub subject: Option<String>,
    pub date: Option<String>,
    pub body: Option<String>,
}

/// Email-provider capability: subscribe/unsubscribe, history delta, message
/// fetch. Implemented by [`GmailClient`]; tests substitute recording fakes.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Subscribe to change notifications for unread mail.
    /// Returns the mailbox's current history checkpoint.
    async fn watch(&self, access_token: &str, email: &str) -> Result<i64>;

    /// Tear down the push subscription.
    async fn stop(&self, access_token: &str, email: &str) -> Result<()>;

    /// Ids of messages added after `start_checkpoint`, oldest first.
    async fn history_since(&self, access_token: &str, start_checkpoint: i64)
        -> Result<Vec<String>>;

    /// Fetch and decode a single message.
    async fn get_message(&self, access_token: &str, message_id: &str) -> Result<MailMessage>;
}

#[derive(Clone)]
pub struct GmailClient {
    http: Client,
    base_url: Url,
    pubsub_topic: String,
}

impl fmt::Debug for GmailClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmailClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GmailClient {
    pub fn new(pubsub_topic: String) -> Self {
        let base_url = Url::parse(GMAIL_API_BASE).expect("valid default Gmail URL");
        Self::with_base_url(pubsub_topic, base_url)
    }

    pub fn with_base_url(pubsub_topic: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("inbox-relay/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            pubsub_topic,
        }
    }

    async fn check(res: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by Gmail: {}", body);
            return Err(anyhow!("received 429 from Gmail: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("gmail {} error {}: {}", what, status, body));
        }
        Ok(res)
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn watch(&self, access_token: &str, _email: &str) -> Result<i64> {
        let url = self.base_url.join("gmail/v1/users/me/watch")?;
        let body = json!({
            "topicName": self.pubsub_topic,
            "labelIds": ["UNREAD"],
        });
        let res = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .context("failed to reach Gmail")?;
        let res = Self::check(res, "watch").await?;
        let payload: WatchResp = res.json().await.context("invalid Gmail watch response")?;
        payload
            .history_id
            .parse::<i64>()
            .context("watch response historyId is not an integer")
    }

    async fn stop(&self, access_token: &str, _email: &str) -> Result<()> {
        let url = self.base_url.join("gmail/v1/users/me/stop")?;
        let res = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("failed to reach Gmail")?;
        Self::check(res, "stop").await?;
        Ok(())
    }

    async fn history_since(
        &self,
        access_token: &str,
        start_checkpoint: i64,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.base_url.join("gmail/v1/users/me/history")?;
            url.query_pairs_mut()
                .append_pair("startHistoryId", &start_checkpoint.to_string())
                .append_pair("historyTypes", "messageAdded");
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let res = self
                .http
                .get(url)
                .bearer_auth(access_token)
                .send()
                .await
                .context("failed to reach Gmail")?;
            let res = Self::check(res, "history").await?;
            let payload: HistoryListResp =
                res.json().await.context("invalid Gmail history response")?;

            for entry in payload.history.unwrap_or_default() {
                for added in entry.messages_added.unwrap_or_default() {
                    // The same id can appear under several history records.
                    if seen.insert(added.message.id.clone()) {
                        ids.push(added.message.id);
                    }
                }
            }

            match payload.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ids)
    }

    async fn get_message(&self, access_token: &str, message_id: &str) -> Result<MailMessage> {
        let mut url = self
            .base_url
            .join(&format!("gmail/v1/users/me/messages/{}", message_id))?;
        url.query_pairs_mut().append_pair("format", "full");

        let res = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("failed to reach Gmail")?;
        let res = Self::check(res, "message").await?;
        let payload: MessageResp = res.json().await.context("invalid Gmail message response")?;

        let Some(part) = payload.payload else {
            return Ok(MailMessage::default());
        };
        let body = match plain_text_data(&part) {
            Some(data) => match decode_base64url(&data) {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(?err, message_id, "failed to decode message body");
                    None
                }
            },
            None => None,
        };
        Ok(MailMessage {
            subject: header_value(&part, "Subject"),
            date: header_value(&part, "Date"),
            body,
        })
    }
}
