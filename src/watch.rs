//! Watch Controller: owns the watch-row lifecycle around the provider's
//! subscribe/unsubscribe calls.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{info, instrument};

use crate::db;
use crate::db::Pool;
use crate::gmail::MailProvider;
use crate::identity::{IdentityProvider, UserIdentity};
use crate::model::{Interval, RefreshWatchPayload, TaskKind, Watch};

/// Subscribe `user`'s mailbox and record the watch. Idempotent: when a watch
/// already exists for the subject this logs and leaves the row untouched.
#[instrument(skip_all, fields(subject = %user.subject))]
pub async fn start_watching(
    pool: &Pool,
    mail: &dyn MailProvider,
    identity: &dyn IdentityProvider,
    user: &UserIdentity,
    phone_number: &str,
) -> Result<bool> {
    if phone_number.trim().is_empty() {
        bail!("phone number is required");
    }
    if db::watch_by_subject(pool, &user.subject).await?.is_some() {
        info!("skipping watch: subject is already watched");
        return Ok(false);
    }

    let token = identity.access_token(&user.auth_ref).await?;
    let checkpoint = mail.watch(&token, &user.email).await?;

    let created = db::insert_watch_if_absent(
        pool,
        &user.subject,
        &user.auth_ref,
        &user.email,
        phone_number,
        checkpoint,
        Interval::EveryHour,
    )
    .await?;
    if created {
        info!(email = %user.email, checkpoint, "added watch");
    } else {
        info!("skipping watch: subject is already watched");
    }
    Ok(created)
}

/// Unsubscribe and delete the watch row. No-op when none exists.
#[instrument(skip_all, fields(subject = %user.subject))]
pub async fn stop_watching(
    pool: &Pool,
    mail: &dyn MailProvider,
    identity: &dyn IdentityProvider,
    user: &UserIdentity,
) -> Result<bool> {
    let Some(watch) = db::watch_by_subject(pool, &user.subject).await? else {
        info!("skipping stop: subject is not watched");
        return Ok(false);
    };

    let token = identity.access_token(&user.auth_ref).await?;
    mail.stop(&token, &watch.email).await?;

    let deleted = db::delete_watch(pool, &user.subject).await?;
    if deleted {
        info!(email = %watch.email, "deleted watch");
    }
    Ok(deleted)
}

pub async fn watch_status(pool: &Pool, subject: &str) -> Result<Option<Watch>> {
    db::watch_by_subject(pool, subject).await
}

/// Re-issue the subscribe call for every watch, via one task per row so that
/// one failing mailbox cannot abort the others. Checkpoints are untouched.
#[instrument(skip_all)]
pub async fn refresh_all(pool: &Pool) -> Result<usize> {
    let watches = db::list_watches(pool).await?;
    let count = watches.len();
    for watch in watches {
        let payload = RefreshWatchPayload {
            subject: watch.subject,
            auth_ref: watch.auth_ref,
            email: watch.email,
        };
        db::enqueue_task(
            pool,
            TaskKind::RefreshWatch,
            &serde_json::to_string(&payload)?,
            Utc::now(),
        )
        .await?;
    }
    info!(count, "scheduled watch refresh");
    Ok(count)
}

/// Task-side half of [`refresh_all`].
pub async fn run_refresh_watch(
    mail: &dyn MailProvider,
    identity: &dyn IdentityProvider,
    payload: &RefreshWatchPayload,
) -> Result<()> {
    let token = identity.access_token(&payload.auth_ref).await?;
    let checkpoint = mail.watch(&token, &payload.email).await?;
    info!(email = %payload.email, checkpoint, "refreshed watch subscription");
    Ok(())
}
