//! `stepwise worker`: crash recovery plus the durable wake scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use stepwise_core::workflow::scheduler::WakeScheduler;
use tokio_util::sync::CancellationToken;

use super::print_json;
use crate::state::AppState;

pub async fn run_worker(state: &AppState, interval_ms: Option<u64>, json: bool) -> Result<()> {
    let recovered = state
        .engine
        .recover()
        .await
        .context("failed to recover interrupted executions")?;

    let mut scheduler = WakeScheduler::new(Arc::clone(&state.engine));
    if let Some(ms) = interval_ms {
        scheduler = scheduler.with_interval(Duration::from_millis(ms.max(1)));
    }
    let interval = scheduler.interval();

    if json {
        print_json(&serde_json::json!({
            "data_dir": state.data_dir,
            "recovered": recovered,
            "poll_interval_ms": interval.as_millis() as u64,
            "max_concurrent_executions": state.config.max_concurrent_executions,
        }))?;
    } else {
        println!();
        println!(
            "  {} Stepwise worker running ({})",
            style("*").green().bold(),
            style(state.data_dir.display()).cyan()
        );
        println!("  Recovered executions: {}", recovered.len());
        println!("  Wake poll interval: {}ms", interval.as_millis());
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    let token = CancellationToken::new();
    let handle = scheduler.spawn(token.clone());

    shutdown_signal().await;
    token.cancel();
    handle.await.context("wake scheduler task panicked")?;

    if !json {
        println!("\n  Worker stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
