use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::fetch::CalendarFetcher;
use crate::mail::{self, Mailer};
use crate::notify::Notice;
use crate::observability::MAIL_TOTAL;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic reconciliation of every unit's feed. The first pass runs
/// immediately.
pub async fn run_sync_loop(engine: Arc<Engine>, fetcher: Arc<dyn CalendarFetcher>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let outcomes = crate::sync::sync_units(&engine, fetcher.as_ref(), None).await;
        for failed in outcomes.iter().filter(|o| o.status.starts_with("ERROR")) {
            warn!("sync {} {}: {}", failed.ota, failed.property_id, failed.status);
        }
    }
}

/// Rewrites the WAL once enough appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("WAL compacted after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Turns notices into emails. Delivery failures are logged and counted.
pub async fn run_notification_dispatcher(
    mut rx: broadcast::Receiver<Notice>,
    mailer: Arc<dyn Mailer>,
    alert_to: Option<String>,
) {
    if alert_to.is_none() {
        warn!("ALERT_TO not set, admin alerts will be skipped");
    }
    loop {
        let notice = match rx.recv().await {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("notification dispatcher lagged, {n} notices dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        for email in mail::compose(&notice, alert_to.as_deref()) {
            match mailer.send(&email).await {
                Ok(()) => {
                    metrics::counter!(MAIL_TOTAL, "status" => "sent").increment(1);
                    info!("mail sent to {}: {}", email.to, email.subject);
                }
                Err(e) => {
                    metrics::counter!(MAIL_TOTAL, "status" => "failed").increment(1);
                    warn!("mail to {} failed: {e}", email.to);
                }
            }
        }
    }
}
