//! Change Processor: reacts to inbound change notifications and runs the
//! deferred fetch/classify/route continuation.
//!
//! The checkpoint is patched immediately on receipt, before the slow fetch
//! work runs. Overlapping or redelivered notifications for one mailbox then
//! converge on the same stored checkpoint; the cost is that a fetch failing
//! after the patch loses that delta instead of reprocessing it.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::classifier::Classifier;
use crate::db::Pool;
use crate::gmail::MailProvider;
use crate::identity::IdentityProvider;
use crate::model::{FetchDeltaPayload, Priority, TaskKind};
use crate::db;
use crate::sms::{format_e164, SmsSender};

/// Handle one provider push: look up the watch by mailbox address, schedule
/// the fetch continuation with the previous checkpoint, then advance the
/// stored checkpoint. Unknown addresses are discarded silently.
#[instrument(skip_all, fields(email = %email))]
pub async fn on_change_notification(
    pool: &Pool,
    email: &str,
    new_checkpoint: i64,
    delay: Duration,
) -> Result<()> {
    let Some(watch) = db::watch_by_email(pool, email).await? else {
        debug!("discarding notification: mailbox is not watched");
        return Ok(());
    };

    let payload = FetchDeltaPayload {
        subject: watch.subject.clone(),
        auth_ref: watch.auth_ref.clone(),
        phone_number: watch.phone_number.clone(),
        prev_checkpoint: watch.checkpoint,
        interval: watch.interval,
    };
    db::enqueue_task(
        pool,
        TaskKind::FetchDelta,
        &serde_json::to_string(&payload)?,
        Utc::now() + delay,
    )
    .await?;
    db::advance_checkpoint(pool, watch.id, new_checkpoint).await?;
    info!(
        prev = watch.checkpoint,
        new = new_checkpoint,
        "scheduled delta fetch and advanced checkpoint"
    );
    Ok(())
}

/// Task-side continuation: fetch every message added since the previous
/// checkpoint, classify each, and route it. Failures are isolated per
/// message; one bad message never aborts its siblings.
#[instrument(skip_all, fields(subject = %payload.subject))]
pub async fn run_fetch_delta(
    pool: &Pool,
    mail: &dyn MailProvider,
    classifier: &dyn Classifier,
    sender: &dyn SmsSender,
    identity: &dyn IdentityProvider,
    country_code: &str,
    payload: &FetchDeltaPayload,
) -> Result<()> {
    let token = identity.access_token(&payload.auth_ref).await?;
    let message_ids = mail
        .history_since(&token, payload.prev_checkpoint)
        .await?;
    debug!(count = message_ids.len(), "fetched history delta");

    for message_id in &message_ids {
        if let Err(err) = process_message(
            pool,
            mail,
            classifier,
            sender,
            country_code,
            &token,
            message_id,
            payload,
        )
        .await
        {
            warn!(?err, message_id, "failed to process message");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_message(
    pool: &Pool,
    mail: &dyn MailProvider,
    classifier: &dyn Classifier,
    sender: &dyn SmsSender,
    country_code: &str,
    token: &str,
    message_id: &str,
    payload: &FetchDeltaPayload,
) -> Result<()> {
    let message = mail.get_message(token, message_id).await?;

    let (Some(mail_subject), Some(date), Some(body)) =
        (message.subject, message.date, message.body)
    else {
        warn!(message_id, "skipping message with missing fields");
        return Ok(());
    };

    let priority = match classifier.classify(&mail_subject, &date, &body).await {
        Ok(priority) => priority,
        Err(err) => {
            warn!(?err, message_id, "classification failed");
            Priority::Error
        }
    };

    match priority {
        Priority::High => {
            let to = format_e164(&payload.phone_number, country_code);
            match sender.send(&to, &mail_subject).await {
                Ok(sid) => info!(message_id, sid, "sent urgent alert"),
                Err(err) => warn!(%err, message_id, "failed to send urgent alert"),
            }
        }
        other => {
            db::insert_notice(
                pool,
                &payload.subject,
                &payload.phone_number,
                &mail_subject,
                other,
                payload.interval,
            )
            .await?;
            debug!(message_id, priority = other.as_str(), "queued notice");
        }
    }
    Ok(())
}
