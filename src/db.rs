use crate::model::{Interval, Notice, Priority, Task, TaskKind, Watch};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn watch_from_row(row: &SqliteRow) -> Result<Watch> {
    let interval: String = row.get("interval");
    Ok(Watch {
        id: row.get("id"),
        subject: row.get("subject"),
        auth_ref: row.get("auth_ref"),
        email: row.get("email"),
        phone_number: row.get("phone_number"),
        checkpoint: row.get("checkpoint"),
        interval: Interval::parse(&interval)
            .ok_or_else(|| anyhow!("unknown interval tag: {}", interval))?,
        created_at: row.get("created_at"),
    })
}

/// Insert a watch row unless one already exists for `subject`.
/// Returns `true` when a new row was created. A single conflict-tolerant
/// insert, so concurrent callers race to one winner and the losers see a
/// plain `false` rather than a constraint error.
#[instrument(skip_all)]
pub async fn insert_watch_if_absent(
    pool: &Pool,
    subject: &str,
    auth_ref: &str,
    email: &str,
    phone_number: &str,
    checkpoint: i64,
    interval: Interval,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO watches (subject, auth_ref, email, phone_number, checkpoint, interval) VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(subject) DO NOTHING",
    )
    .bind(subject)
    .bind(auth_ref)
    .bind(email)
    .bind(phone_number)
    .bind(checkpoint)
    .bind(interval.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn watch_by_subject(pool: &Pool, subject: &str) -> Result<Option<Watch>> {
    let row = sqlx::query("SELECT * FROM watches WHERE subject = ?")
        .bind(subject)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(watch_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn watch_by_email(pool: &Pool, email: &str) -> Result<Option<Watch>> {
    let row = sqlx::query("SELECT * FROM watches WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(watch_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_watches(pool: &Pool) -> Result<Vec<Watch>> {
    let rows = sqlx::query("SELECT * FROM watches ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(watch_from_row).collect()
}

/// Delete the watch for `subject`. Returns `true` when a row was removed.
#[instrument(skip_all)]
pub async fn delete_watch(pool: &Pool, subject: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM watches WHERE subject = ?")
        .bind(subject)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Last-write-wins checkpoint patch, keyed by row id.
#[instrument(skip_all)]
pub async fn advance_checkpoint(pool: &Pool, watch_id: i64, checkpoint: i64) -> Result<()> {
    sqlx::query("UPDATE watches SET checkpoint = ? WHERE id = ?")
        .bind(checkpoint)
        .bind(watch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_notice(
    pool: &Pool,
    subject: &str,
    phone_number: &str,
    mail_subject: &str,
    priority: Priority,
    interval: Interval,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO notices (subject, phone_number, mail_subject, priority, interval) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(subject)
    .bind(phone_number)
    .bind(mail_subject)
    .bind(priority.as_str())
    .bind(interval.as_str())
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Snapshot read of an interval bucket, in arrival order. The drainer must
/// delete exactly the ids returned here, never a fresh re-query.
#[instrument(skip_all)]
pub async fn notices_for_interval(pool: &Pool, interval: Interval) -> Result<Vec<Notice>> {
    let rows = sqlx::query(
        "SELECT id, subject, phone_number, mail_subject, priority, interval FROM notices WHERE interval = ? ORDER BY id",
    )
    .bind(interval.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let priority: String = row.get("priority");
            let interval: String = row.get("interval");
            Ok(Notice {
                id: row.get("id"),
                subject: row.get("subject"),
                phone_number: row.get("phone_number"),
                mail_subject: row.get("mail_subject"),
                priority: parse_priority_tag(&priority),
                interval: Interval::parse(&interval)
                    .ok_or_else(|| anyhow!("unknown interval tag: {}", interval))?,
            })
        })
        .collect()
}

fn parse_priority_tag(s: &str) -> Priority {
    match s {
        "high" => Priority::High,
        "medium" => Priority::Medium,
        "low" => Priority::Low,
        "unclear" => Priority::Unclear,
        _ => Priority::Error,
    }
}

#[instrument(skip_all)]
pub async fn delete_notices(pool: &Pool, ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("DELETE FROM notices WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn enqueue_task(
    pool: &Pool,
    kind: TaskKind,
    payload: &str,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO tasks (kind, payload, due_at) VALUES (?, ?, ?) RETURNING id")
        .bind(kind.as_str())
        .bind(payload)
        .bind(due_at)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn next_due_task(pool: &Pool) -> Result<Option<Task>> {
    let row = sqlx::query(
        "SELECT id, kind, payload FROM tasks WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let kind: String = row.get("kind");
    Ok(Some(Task {
        id: row.get("id"),
        kind: TaskKind::parse(&kind).ok_or_else(|| anyhow!("unknown task kind: {}", kind))?,
        payload: row.get("payload"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_task(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
