//! Gmail API response payloads and the pure extraction helpers over them.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResp {
    pub history_id: String,
    pub expiration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryListResp {
    pub history: Option<Vec<HistoryEntry>>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub messages_added: Option<Vec<MessageAdded>>,
}

#[derive(Debug, Deserialize)]
pub struct MessageAdded {
    pub message: MessageRef,
}

#[derive(Debug, Deserialize)]
pub struct MessageRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResp {
    pub id: String,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub mime_type: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<PartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

#[derive(Debug, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct PartBody {
    pub data: Option<String>,
}

/// Decode Gmail's base64url transport encoding into UTF-8 text.
/// Gmail omits padding; tolerate padded input by stripping trailing `=`.
pub fn decode_base64url(data: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .context("invalid base64url data")?;
    String::from_utf8(bytes).context("decoded body is not valid UTF-8")
}

/// Case-insensitive header lookup on the top-level payload.
pub fn header_value(part: &MessagePart, name: &str) -> Option<String> {
    part.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Find the base64url payload of the first `text/plain` part, searching the
/// part tree depth-first. Single-part messages carry the data at the root,
/// so fall back to the root body when no part matches.
pub fn plain_text_data(root: &MessagePart) -> Option<String> {
    find_plain_part(root).or_else(|| root.body.as_ref().and_then(|b| b.data.clone()))
}

fn find_plain_part(part: &MessagePart) -> Option<String> {
    let is_plain = part
        .mime_type
        .as_deref()
        .map(|m| m.starts_with("text/plain"))
        .unwrap_or(false);
    if is_plain {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.clone()) {
            return Some(data);
        }
    }
    part.parts.as_ref()?.iter().find_map(find_plain_part)
}
