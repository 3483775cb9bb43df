use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use slotbook::config::Config;
use slotbook::engine::Engine;
use slotbook::notify::LogNotifier;
use slotbook::review::ReviewDesk;
use slotbook::{jobs, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("slotbook.wal");

    let engine = Arc::new(Engine::open(
        wal_path.clone(),
        Arc::new(LogNotifier),
        Arc::new(slotbook::clock::SystemClock),
        config.policy,
    )?);
    let desk = Arc::new(ReviewDesk::new(engine.clone(), config.draft_ttl));

    info!("slotbook started");
    info!("  wal: {}", wal_path.display());
    info!(
        "  business day: {}-{}, buffer {} min, notice {} min",
        config.policy.day_open.format("%H:%M"),
        config.policy.day_close.format("%H:%M"),
        config.policy.slot_buffer_minutes,
        config.policy.reschedule_notice_minutes
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let background = [
        tokio::spawn(jobs::run_reminders(engine.clone(), config.reminder_interval)),
        tokio::spawn(jobs::run_compactor(engine.clone(), config.compact_threshold)),
        tokio::spawn(jobs::run_draft_sweeper(
            desk.clone(),
            config.draft_ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1)),
        )),
    ];

    // Run until SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background jobs");
    for handle in background {
        handle.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction skipped: {e}");
    }

    info!("slotbook stopped");
    Ok(())
}
