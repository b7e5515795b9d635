use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Urgency label produced by the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
    Unclear,
    Error,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Unclear => "unclear",
            Priority::Error => "error",
        }
    }
}

/// How often queued notices for a watch are consolidated into a digest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Interval {
    EveryHour,
    Every2Hours,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::EveryHour => "every_hour",
            Interval::Every2Hours => "every_2_hours",
        }
    }

    pub fn parse(s: &str) -> Option<Interval> {
        match s {
            "every_hour" => Some(Interval::EveryHour),
            "every_2_hours" => Some(Interval::Every2Hours),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    FetchDelta,
    RefreshWatch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::FetchDelta => "fetch_delta",
            TaskKind::RefreshWatch => "refresh_watch",
        }
    }

    pub fn parse(s: &str) -> Option<TaskKind> {
        match s {
            "fetch_delta" => Some(TaskKind::FetchDelta),
            "refresh_watch" => Some(TaskKind::RefreshWatch),
            _ => None,
        }
    }
}

/// Parse a decoded change-notification body: a JSON object with both an
/// `emailAddress` and a `historyId` (the latter arrives as either a number
/// or a numeric string). Anything else is not a change notification.
pub fn decode_change_notification(json_text: &str) -> Option<(String, i64)> {
    let value: serde_json::Value = serde_json::from_str(json_text).ok()?;
    let email = value.get("emailAddress")?.as_str()?.to_string();
    let history_id = value.get("historyId")?;
    let checkpoint = match history_id {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    Some((email, checkpoint))
}

/// One actively-watched mailbox. At most one row per `subject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watch {
    pub id: i64,
    pub subject: String,
    pub auth_ref: String,
    pub email: String,
    pub phone_number: String,
    pub checkpoint: i64,
    pub interval: Interval,
    pub created_at: DateTime<Utc>,
}

/// A non-urgent notice waiting for the next digest of its interval bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub id: i64,
    pub subject: String,
    pub phone_number: String,
    pub mail_subject: String,
    pub priority: Priority,
    pub interval: Interval,
}

/// Deferred continuation stored in the task queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub payload: String,
}

/// Payload for a `fetch_delta` task. Carries the checkpoint captured before
/// the stored one was advanced, so the fetch covers exactly the gap the
/// notification announced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchDeltaPayload {
    pub subject: String,
    pub auth_ref: String,
    pub phone_number: String,
    pub prev_checkpoint: i64,
    pub interval: Interval,
}

/// Payload for a `refresh_watch` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshWatchPayload {
    pub subject: String,
    pub auth_ref: String,
    pub email: String,
}
