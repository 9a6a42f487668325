//! `corral orchestrate` command: run one card to completion or watch the
//! trigger list.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use corral_core::config::Settings;
use corral_core::scheduler::SchedulerConfig;
use corral_core::supervisor::Supervisor;

/// Run the orchestrate command.
///
/// Exits cleanly (code 0) on completion or a graceful stop; propagates an
/// error (nonzero exit) on unrecoverable failures.
pub async fn run_orchestrate(
    card_id: Option<&str>,
    watch: bool,
    max_agents: usize,
    poll_interval_secs: u64,
    agent_timeout_secs: u64,
) -> Result<()> {
    let settings = Settings::from_env()?;

    let scheduler_config = SchedulerConfig {
        max_agents,
        poll_interval: Duration::from_secs(poll_interval_secs),
        worker_timeout: Duration::from_secs(agent_timeout_secs),
        worker_limit: settings.worker_limit,
    };

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let supervisor = Supervisor::from_settings(&settings, scheduler_config, cancel).await?;

    if watch {
        supervisor.watch().await
    } else {
        // clap guarantees exactly one of --card-id / --watch.
        let card_id = card_id.expect("clap enforces the card-id/watch group");
        supervisor.orchestrate(card_id).await
    }
}
