use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::review::ReviewDesk;

/// Periodically remind owners of appointments starting soon.
pub async fn run_reminders(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let report = engine.send_reminders().await;
        tracing::debug!("reminder tick: {} sent, {} failed", report.sent, report.failed);
    }
}

/// Rewrite the WAL once enough appends have accumulated since the last
/// compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Drop review drafts that have sat idle past their TTL.
pub async fn run_draft_sweeper(desk: Arc<ReviewDesk>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = desk.purge_expired();
        if purged > 0 {
            info!("evicted {purged} idle review drafts");
        }
    }
}
