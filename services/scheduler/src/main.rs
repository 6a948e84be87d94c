//! Lattice scheduler binary.
//!
//! Speaks the scheduler protocol as newline-delimited JSON: events on stdin,
//! calls on stdout. Logs go to stderr.
//!
//! The in-memory collaborators are seeded from the environment at startup
//! (see [`SeedConfig`]). Nothing changes them while running.
//!
//! Exit codes:
//! - 0: stopped by Ctrl+C
//! - 2: protocol error
//! - 3: lost connection to the master
//! - 4: unrecoverable error

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lattice_scheduler::abort::{AbortReason, AbortSignal, ProcessAbort, TracingNotifier};
use lattice_scheduler::collaborators::{
    InMemoryHostHealth, LoggingMessageHandler, LoggingStatusUpdateHandler, NoopLeaderCache,
    NoopStartupRecovery,
};
use lattice_scheduler::gate::{DisasterManager, StatusUpdateDeltaAverage};
use lattice_scheduler::offers::{FirstFitMatcher, InMemoryOfferCache, TaskRequest};
use lattice_scheduler::stdio::StdioSchedulerClient;
use lattice_scheduler::tasks::InMemoryTaskStore;
use lattice_scheduler::{Collaborators, Config, SchedulerCoordinator, SeedConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // stdout carries protocol calls, so logs must not go there.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(
        master = %config.scheduler.master,
        cache_offers = config.scheduler.cache_offers,
        delay_offers_for_status_delta = config.scheduler.delay_offers_for_status_delta,
        "Starting lattice scheduler"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (abort, mut abort_rx) = ProcessAbort::new();

    let client = Arc::new(StdioSchedulerClient::stdio());
    let task_store = Arc::new(InMemoryTaskStore::new());
    let offer_cache = Arc::new(InMemoryOfferCache::new(
        config.offer_cache.clone(),
        client.clone(),
    ));
    let matcher = Arc::new(FirstFitMatcher::new(task_store.clone()));
    let gate = Arc::new(DisasterManager::new());
    let host_health = Arc::new(InMemoryHostHealth::new());
    seed(&config.seed, &matcher, &gate, &host_health).await?;

    let sweep_handle = tokio::spawn(Arc::clone(&offer_cache).run_sweep(shutdown_rx));

    let coordinator = SchedulerCoordinator::new(
        config.scheduler.clone(),
        Collaborators {
            client: client.clone(),
            matcher,
            offer_cache,
            gate,
            status_delta: Arc::new(StatusUpdateDeltaAverage::new()),
            status_handler: Arc::new(LoggingStatusUpdateHandler),
            message_handler: Arc::new(LoggingMessageHandler),
            host_health,
            task_store,
            leader_cache: Arc::new(NoopLeaderCache),
            startup: Arc::new(NoopStartupRecovery),
            notifier: Arc::new(TracingNotifier),
            abort: Arc::new(abort),
        },
    );

    let exit_code = match coordinator.start().await {
        Err(e) => {
            error!(error = %e, "Failed to start scheduler");
            AbortReason::ProtocolError.exit_code()
        }
        Ok(()) => {
            tokio::select! {
                signal = wait_for_abort(&mut abort_rx) => {
                    let signal = signal.unwrap_or(AbortSignal::new(AbortReason::UnrecoverableError));
                    error!(
                        reason = %signal.reason,
                        cause = signal.cause.as_deref().unwrap_or(""),
                        "Scheduler aborted"
                    );
                    signal.reason.exit_code()
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    coordinator.notify_stopping().await;
                    coordinator.wait_for_status_updates().await;
                    0
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep_handle.await {
        warn!(error = %e, "Offer cache sweeper task failed");
    }

    info!(exit_code, "Lattice scheduler stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Loads the configured seeds into the in-memory collaborators.
async fn seed(
    seed: &SeedConfig,
    matcher: &FirstFitMatcher,
    gate: &DisasterManager,
    host_health: &InMemoryHostHealth,
) -> Result<()> {
    if let Some(path) = &seed.task_requests_file {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read task requests from {}", path.display()))?;
        let requests = TaskRequest::list_from_json(&json)
            .with_context(|| format!("invalid task requests in {}", path.display()))?;
        info!(count = requests.len(), path = %path.display(), "Queued task requests");
        for request in requests {
            matcher.submit(request).await;
        }
    }
    for host in &seed.decommissioned_hosts {
        info!(host = %host, "Host decommissioned");
        host_health.decommission_host(host.clone()).await;
    }
    for action in &seed.disabled_actions {
        gate.disable(*action);
    }
    Ok(())
}

/// Resolves with the first abort signal, or `None` if the sender is gone.
async fn wait_for_abort(
    rx: &mut watch::Receiver<Option<AbortSignal>>,
) -> Option<AbortSignal> {
    loop {
        if let Some(signal) = rx.borrow_and_update().clone() {
            return Some(signal);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}
