//! Deferred-task worker. Executes `fetch_delta` and `refresh_watch`
//! continuations from the durable task queue.
//!
//! At-most-once: the row is deleted after the attempt whether it succeeded
//! or not. Failures surface as log lines, never as retries.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::classifier::Classifier;
use crate::db::Pool;
use crate::gmail::MailProvider;
use crate::identity::IdentityProvider;
use crate::model::{FetchDeltaPayload, RefreshWatchPayload, TaskKind};
use crate::sms::SmsSender;
use crate::{db, processor, watch};

/// Run the next due task, if any. Returns whether a task was attempted.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &Pool,
    mail: &dyn MailProvider,
    classifier: &dyn Classifier,
    sender: &dyn SmsSender,
    identity: &dyn IdentityProvider,
    country_code: &str,
) -> Result<bool> {
    let Some(task) = db::next_due_task(pool).await? else {
        return Ok(false);
    };

    let res: Result<()> = match task.kind {
        TaskKind::FetchDelta => match serde_json::from_str::<FetchDeltaPayload>(&task.payload) {
            Ok(payload) => {
                processor::run_fetch_delta(
                    pool,
                    mail,
                    classifier,
                    sender,
                    identity,
                    country_code,
                    &payload,
                )
                .await
            }
            Err(err) => Err(err.into()),
        },
        TaskKind::RefreshWatch => match serde_json::from_str::<RefreshWatchPayload>(&task.payload)
        {
            Ok(payload) => watch::run_refresh_watch(mail, identity, &payload).await,
            Err(err) => Err(err.into()),
        },
    };

    match res {
        Ok(()) => info!(id = task.id, kind = task.kind.as_str(), "task succeeded"),
        Err(err) => warn!(
            ?err,
            id = task.id,
            kind = task.kind.as_str(),
            "task failed; dropping"
        ),
    }
    db::delete_task(pool, task.id).await?;
    Ok(true)
}
