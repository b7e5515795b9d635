//! Batching queue drainer: consolidates an interval bucket of queued notices
//! into one digest SMS per user.

use anyhow::Result;
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::db::Pool;
use crate::model::Interval;
use crate::sms::SmsSender;
use crate::db;

#[derive(Debug)]
struct DigestGroup {
    phone_number: String,
    mail_subjects: Vec<String>,
}

/// Drain one interval bucket: snapshot-read its notices, send one digest per
/// identity, then delete exactly the rows the snapshot contained. Rows
/// enqueued while the drain runs survive to the next cycle. Returns the
/// number of digests dispatched.
#[instrument(skip_all, fields(interval = interval.as_str()))]
pub async fn drain(pool: &Pool, sender: &dyn SmsSender, interval: Interval) -> Result<usize> {
    let snapshot = db::notices_for_interval(pool, interval).await?;
    if snapshot.is_empty() {
        return Ok(0);
    }

    // Explicit identity -> accumulated-subjects map, one pass in arrival order.
    let mut groups: BTreeMap<String, DigestGroup> = BTreeMap::new();
    for notice in &snapshot {
        groups
            .entry(notice.subject.clone())
            .or_insert_with(|| DigestGroup {
                phone_number: notice.phone_number.clone(),
                mail_subjects: Vec::new(),
            })
            .mail_subjects
            .push(notice.mail_subject.clone());
    }

    let sends = groups.values().map(|group| {
        let body = digest_body(&group.mail_subjects);
        async move { (group.phone_number.clone(), sender.send(&group.phone_number, &body).await) }
    });
    let dispatched = groups.len();
    for (phone_number, result) in join_all(sends).await {
        match result {
            Ok(sid) => info!(phone_number, sid, "sent digest"),
            Err(err) => warn!(%err, phone_number, "failed to send digest"),
        }
    }

    // Deletions come from the same snapshot as the groups; dispatch outcomes
    // do not keep rows alive.
    let ids: Vec<i64> = snapshot.iter().map(|n| n.id).collect();
    db::delete_notices(pool, &ids).await?;
    info!(notices = ids.len(), dispatched, "drained interval bucket");
    Ok(dispatched)
}

/// Digest body text, labeled distinctly from a single urgent alert.
pub fn digest_body(mail_subjects: &[String]) -> String {
    format!(
        "{} OTHER EMAILS: {}",
        mail_subjects.len(),
        mail_subjects.join("; ")
    )
}
