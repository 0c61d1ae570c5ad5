use std::env;

use genquote_backend::state::AppState;
use genquote_backend::AppPaths;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = AppPaths::new();
    genquote_backend::core::logging::init(&paths);

    let state = AppState::initialize_with(paths).await?;
    let engine = state.engine.clone();

    if env::args().any(|arg| arg == "--rebuild-index") {
        let written = engine.rebuild_index().await?;
        println!("rebuilt vector index with {written} example(s)");
        return Ok(());
    }

    let interval = state.engine_config.reconcile.interval;
    tracing::info!(
        interval_secs = interval.as_secs(),
        "reconciliation daemon started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = engine.reconcile_once().await {
                    tracing::error!("reconciliation pass failed: {err}");
                }
            }
        }
    }

    if let Ok(stats) = engine.stats().await {
        tracing::info!(
            examples = stats.examples.committed,
            vectors = stats.vectors,
            "daemon stopped"
        );
    }
    Ok(())
}
