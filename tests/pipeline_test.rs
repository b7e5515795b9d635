use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use inbox_relay::classifier::Classifier;
use inbox_relay::db;
use inbox_relay::gmail::{MailMessage, MailProvider};
use inbox_relay::identity::{IdentityProvider, UserIdentity};
use inbox_relay::model::Priority;
use inbox_relay::processor::on_change_notification;
use inbox_relay::sms::{DispatchError, SmsSender};
use inbox_relay::tasks::process_next_task;
use inbox_relay::watch;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct FakeMail {
    watch_history_id: i64,
    history: HashMap<i64, Vec<String>>,
    messages: HashMap<String, MailMessage>,
    watch_calls: Arc<Mutex<Vec<String>>>,
    stop_calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MailProvider for FakeMail {
    async fn watch(&self, _access_token: &str, email: &str) -> Result<i64> {
        self.watch_calls.lock().await.push(email.to_string());
        Ok(self.watch_history_id)
    }

    async fn stop(&self, _access_token: &str, email: &str) -> Result<()> {
        self.stop_calls.lock().await.push(email.to_string());
        Ok(())
    }

    async fn history_since(
        &self,
        _access_token: &str,
        start_checkpoint: i64,
    ) -> Result<Vec<String>> {
        Ok(self.history.get(&start_checkpoint).cloned().unwrap_or_default())
    }

    async fn get_message(&self, _access_token: &str, message_id: &str) -> Result<MailMessage> {
        self.messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such message: {}", message_id))
    }
}

/// Classifies by looking the mail subject up in a fixed map.
#[derive(Clone, Default)]
struct MapClassifier {
    by_subject: HashMap<String, Priority>,
}

#[async_trait]
impl Classifier for MapClassifier {
    async fn classify(&self, subject: &str, _date: &str, _body: &str) -> Result<Priority> {
        Ok(self
            .by_subject
            .get(subject)
            .copied()
            .unwrap_or(Priority::Unclear))
    }
}

#[derive(Clone, Default)]
struct RecordingSms {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingSms {
    async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SmsSender for RecordingSms {
    async fn send(&self, to: &str, body: &str) -> Result<String, DispatchError> {
        self.calls.lock().await.push((to.to_string(), body.to_string()));
        Ok("SM_test".to_string())
    }
}

struct StaticIdentity;

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve(&self, _bearer: &str) -> Result<UserIdentity> {
        Ok(test_user())
    }

    async fn access_token(&self, _auth_ref: &str) -> Result<String> {
        Ok("oauth-token".to_string())
    }
}

fn test_user() -> UserIdentity {
    UserIdentity {
        subject: "user_1".to_string(),
        email: "alice@example.com".to_string(),
        auth_ref: "user_1".to_string(),
    }
}

fn message(subject: &str, body: Option<&str>) -> MailMessage {
    MailMessage {
        subject: Some(subject.to_string()),
        date: Some("Tue, 4 Mar 2025 09:12:00 -0500".to_string()),
        body: body.map(str::to_string),
    }
}

#[tokio::test]
async fn start_watching_twice_keeps_one_watch() {
    let pool = setup_pool().await;
    let mail = FakeMail {
        watch_history_id: 100,
        ..Default::default()
    };
    let identity = StaticIdentity;
    let user = test_user();

    let created = watch::start_watching(&pool, &mail, &identity, &user, "5551234567")
        .await
        .unwrap();
    assert!(created);
    let created = watch::start_watching(&pool, &mail, &identity, &user, "5551234567")
        .await
        .unwrap();
    assert!(!created);

    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watches")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(cnt, 1);
    // The duplicate call returned before touching the provider.
    assert_eq!(mail.watch_calls.lock().await.len(), 1);
}

#[tokio::test]
async fn start_watching_rejects_empty_phone_number() {
    let pool = setup_pool().await;
    let mail = FakeMail {
        watch_history_id: 100,
        ..Default::default()
    };
    let identity = StaticIdentity;
    let user = test_user();

    assert!(watch::start_watching(&pool, &mail, &identity, &user, "   ")
        .await
        .is_err());

    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watches")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(cnt, 0);
    // Rejected before any provider call.
    assert!(mail.watch_calls.lock().await.is_empty());
}

#[tokio::test]
async fn notification_after_stop_is_discarded() {
    let pool = setup_pool().await;
    let mail = FakeMail {
        watch_history_id: 100,
        ..Default::default()
    };
    let identity = StaticIdentity;
    let user = test_user();

    watch::start_watching(&pool, &mail, &identity, &user, "5551234567")
        .await
        .unwrap();
    assert!(watch::stop_watching(&pool, &mail, &identity, &user).await.unwrap());
    assert_eq!(mail.stop_calls.lock().await.len(), 1);

    on_change_notification(&pool, "alice@example.com", 105, Duration::zero())
        .await
        .unwrap();

    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(tasks, 0);
}

#[tokio::test]
async fn delta_routes_high_immediately_and_queues_low() {
    let pool = setup_pool().await;
    let mut mail = FakeMail {
        watch_history_id: 100,
        ..Default::default()
    };
    mail.history
        .insert(100, vec!["m1".to_string(), "m2".to_string()]);
    mail.messages
        .insert("m1".to_string(), message("Interview availability", Some("let's talk")));
    mail.messages
        .insert("m2".to_string(), message("Weekly newsletter", Some("fun runs")));

    let mut classifier = MapClassifier::default();
    classifier
        .by_subject
        .insert("Interview availability".to_string(), Priority::High);
    classifier
        .by_subject
        .insert("Weekly newsletter".to_string(), Priority::Low);

    let sms = RecordingSms::default();
    let identity = StaticIdentity;
    let user = test_user();

    watch::start_watching(&pool, &mail, &identity, &user, "5551234567")
        .await
        .unwrap();

    on_change_notification(&pool, "alice@example.com", 105, Duration::zero())
        .await
        .unwrap();

    // Checkpoint advances before the fetch continuation runs.
    let checkpoint: i64 = sqlx::query_scalar("SELECT checkpoint FROM watches WHERE subject = 'user_1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(checkpoint, 105);

    let processed = process_next_task(&pool, &mail, &classifier, &sms, &identity, "+1")
        .await
        .unwrap();
    assert!(processed);

    let calls = sms.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "+15551234567");
    assert_eq!(calls[0].1, "Interview availability");

    let queued: Vec<(String, String)> =
        sqlx::query_as("SELECT mail_subject, priority FROM notices")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(queued, vec![("Weekly newsletter".to_string(), "low".to_string())]);
}

#[tokio::test]
async fn redelivered_notification_does_not_duplicate_notices() {
    let pool = setup_pool().await;
    let mut mail = FakeMail {
        watch_history_id: 100,
        ..Default::default()
    };
    mail.history.insert(100, vec!["m1".to_string()]);
    // Nothing newer than checkpoint 105: the redelivered fetch sees an empty delta.
    mail.messages
        .insert("m1".to_string(), message("Weekly newsletter", Some("fun runs")));

    let mut classifier = MapClassifier::default();
    classifier
        .by_subject
        .insert("Weekly newsletter".to_string(), Priority::Low);
    let sms = RecordingSms::default();
    let identity = StaticIdentity;
    let user = test_user();

    watch::start_watching(&pool, &mail, &identity, &user, "5551234567")
        .await
        .unwrap();

    on_change_notification(&pool, "alice@example.com", 105, Duration::zero())
        .await
        .unwrap();
    on_change_notification(&pool, "alice@example.com", 105, Duration::zero())
        .await
        .unwrap();

    while process_next_task(&pool, &mail, &classifier, &sms, &identity, "+1")
        .await
        .unwrap()
    {}

    let checkpoint: i64 = sqlx::query_scalar("SELECT checkpoint FROM watches WHERE subject = 'user_1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(checkpoint, 105);

    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notices")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(queued, 1);
    assert!(sms.calls().await.is_empty());
}

#[tokio::test]
async fn message_with_missing_body_is_skipped_without_harming_siblings() {
    let pool = setup_pool().await;
    let mut mail = FakeMail {
        watch_history_id: 100,
        ..Default::default()
    };
    mail.history
        .insert(100, vec!["broken".to_string(), "ok".to_string()]);
    mail.messages
        .insert("broken".to_string(), message("No body here", None));
    mail.messages
        .insert("ok".to_string(), message("Club announcements", Some("hello")));

    let mut classifier = MapClassifier::default();
    classifier
        .by_subject
        .insert("Club announcements".to_string(), Priority::Low);
    let sms = RecordingSms::default();
    let identity = StaticIdentity;
    let user = test_user();

    watch::start_watching(&pool, &mail, &identity, &user, "5551234567")
        .await
        .unwrap();
    on_change_notification(&pool, "alice@example.com", 101, Duration::zero())
        .await
        .unwrap();
    process_next_task(&pool, &mail, &classifier, &sms, &identity, "+1")
        .await
        .unwrap();

    let queued: Vec<(String,)> = sqlx::query_as("SELECT mail_subject FROM notices")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(queued, vec![("Club announcements".to_string(),)]);
}

#[tokio::test]
async fn refresh_all_schedules_one_task_per_watch_and_keeps_checkpoints() {
    let pool = setup_pool().await;
    let mail = FakeMail {
        watch_history_id: 300,
        ..Default::default()
    };
    let classifier = MapClassifier::default();
    let sms = RecordingSms::default();
    let identity = StaticIdentity;

    db::insert_watch_if_absent(
        &pool,
        "user_1",
        "user_1",
        "alice@example.com",
        "5551234567",
        100,
        inbox_relay::model::Interval::EveryHour,
    )
    .await
    .unwrap();
    db::insert_watch_if_absent(
        &pool,
        "user_2",
        "user_2",
        "bob@example.com",
        "5559876543",
        200,
        inbox_relay::model::Interval::Every2Hours,
    )
    .await
    .unwrap();

    let scheduled = watch::refresh_all(&pool).await.unwrap();
    assert_eq!(scheduled, 2);

    while process_next_task(&pool, &mail, &classifier, &sms, &identity, "+1")
        .await
        .unwrap()
    {}

    let calls = mail.watch_calls.lock().await.clone();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&"alice@example.com".to_string()));
    assert!(calls.contains(&"bob@example.com".to_string()));

    // Refresh renews the subscription without resetting checkpoints.
    let checkpoints: Vec<(String, i64)> =
        sqlx::query_as("SELECT subject, checkpoint FROM watches ORDER BY subject")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(
        checkpoints,
        vec![("user_1".to_string(), 100), ("user_2".to_string(), 200)]
    );
}
