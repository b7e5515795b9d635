//! Priority classification over a chat-completions endpoint.
//!
//! The model's free-text reply is matched against the label set in priority
//! order, so a hedging reply that mentions several labels resolves to the
//! most urgent one it names.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;

use crate::model::Priority;

const LLM_API_BASE: &str = "https://api.openai.com/";

const INSTRUCTION: &str = "You triage email for a busy person. Given an email's \
subject, date, and body, answer with exactly one word: high, medium, low, or \
unclear. high means time-sensitive and important to the recipient, such as an \
interview request, a meeting that must be scheduled, or an action with a short \
deadline. low means solicitations, newsletters, and other mail that can wait. \
Use medium for everything in between and unclear when you cannot tell.";

const EXAMPLE_HIGH: &str = "Subject: Interview availability this week?\n\
Date: Tue, 4 Mar 2025 09:12:00 -0500\n\
Body: Hi, we'd love to schedule a 45-minute interview. Could you share times \
you are free on Thursday or Friday?";

const EXAMPLE_LOW: &str = "Subject: March newsletter: join our weekly runs!\n\
Date: Sat, 1 Mar 2025 08:00:00 -0500\n\
Body: The running club meets every Sunday. Renew your membership today and \
bring a friend!";

/// Text-classification capability. Tests substitute a canned implementation.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, subject: &str, date: &str, body: &str) -> Result<Priority>;
}

#[derive(Clone)]
pub struct LlmClassifier {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for LlmClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClassifier")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl LlmClassifier {
    pub fn new(api_key: String, model: String) -> Self {
        let base_url = Url::parse(LLM_API_BASE).expect("valid default LLM URL");
        Self::with_base_url(api_key, model, base_url)
    }

    pub fn with_base_url(api_key: String, model: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("inbox-relay/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            model,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, subject: &str, date: &str, body: &str) -> Result<Priority> {
        let url = self.base_url.join("v1/chat/completions")?;
        let prompt = format!("Subject: {}\nDate: {}\nBody: {}", subject, date, body);
        let request = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": INSTRUCTION },
                { "role": "user", "content": EXAMPLE_HIGH },
                { "role": "assistant", "content": "high" },
                { "role": "user", "content": EXAMPLE_LOW },
                { "role": "assistant", "content": "low" },
                { "role": "user", "content": prompt },
            ],
        });

        let res = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("failed to reach classifier")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("classifier error {}: {}", status, body));
        }

        let payload: ChatResponse = res.json().await.context("invalid classifier response")?;
        let content = payload
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("classifier returned no choices"))?;
        Ok(parse_priority(content))
    }
}

/// Map a free-text response to a label: case-insensitive substring match in
/// the order high > medium > low > unclear; no match means `Error`.
pub fn parse_priority(response: &str) -> Priority {
    let lower = response.to_lowercase();
    for candidate in [
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Unclear,
    ] {
        if lower.contains(candidate.as_str()) {
            return candidate;
        }
    }
    Priority::Error
}
