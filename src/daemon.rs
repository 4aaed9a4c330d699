//! Daemon wiring: construct every component, run until SIGTERM
//!
//! Components receive their dependencies at construction; there is no global
//! state. Shutdown is cooperative: the watch channel flips, the API stops
//! accepting work, loops finish their current tick, the cost tracker flushes
//! a final accrual pass, and running instances are left alive to survive the
//! restart.

use crate::api::{self, AppState, AuthVerifier, RateLimiter};
use crate::config::{Config, ConfigHandle};
use crate::cost::CostTracker;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::events::EventBus;
use crate::providers::ProviderRegistry;
use crate::provisioner::Provisioner;
use crate::reaper::Reaper;
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run(config: Config) -> Result<()> {
    config.validate()?;
    let config = Arc::new(ConfigHandle::new(config));
    let snapshot = config.snapshot();

    let store = JobStore::open(&snapshot.store.path).await?;
    let bus = EventBus::new();
    let registry = Arc::new(ProviderRegistry::from_config(&snapshot).await?);
    if registry.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "providers".to_string(),
            reason: "no provider could be constructed".to_string(),
        }
        .into());
    }
    let auth = AuthVerifier::from_config(&snapshot.auth)?;
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ConfigError::InvalidValue {
            field: "metrics".to_string(),
            reason: e.to_string(),
        })?;

    // boot recovery: persisted rows are the truth, in-memory views rebuild
    // from them. Claims held by the previous process are released so the
    // first scheduling pass sees the whole queue.
    let released = store.release_expired_claims(Utc::now()).await?;
    if released > 0 {
        info!(released, "released stale scheduler claims from previous run");
    }

    let cost = Arc::new(CostTracker::new(store.clone(), Arc::clone(&config)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut provisioner = Provisioner::new(
        store.clone(),
        Arc::clone(&registry),
        bus.clone(),
        Arc::clone(&config),
        Arc::clone(&cost),
    );
    let capacity = provisioner.capacity_requester();
    let mut tasks = provisioner.spawn(shutdown_rx.clone());

    let scheduler = Scheduler::new(
        store.clone(),
        bus.clone(),
        Arc::clone(&config),
        Arc::clone(&cost),
        capacity,
    );
    tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    let dispatcher = Dispatcher::new(
        store.clone(),
        bus.clone(),
        Arc::clone(&config),
        Arc::clone(&cost),
        Arc::clone(&registry),
    );
    tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));

    let reaper = Reaper::new(
        store.clone(),
        bus.clone(),
        Arc::clone(&config),
        Arc::clone(&cost),
        Arc::clone(&registry),
    );
    tasks.push(tokio::spawn(reaper.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(Arc::clone(&cost).run(shutdown_rx.clone())));

    let state = Arc::new(AppState {
        store,
        bus,
        config: Arc::clone(&config),
        cost,
        registry,
        auth,
        limiter: RateLimiter::new(
            snapshot.server.rate_limit_burst,
            snapshot.server.rate_limit_per_sec,
        ),
        metrics: metrics_handle,
    });
    let listener = tokio::net::TcpListener::bind(&snapshot.server.listen_addr).await?;
    let server = tokio::spawn(api::serve(state, listener, shutdown_rx));

    wait_for_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    // bounded wind-down: the API closes first, then the component loops;
    // anything still stuck after the grace window is abandoned to the
    // process exit (instances survive on the providers)
    if let Err(e) = tokio::time::timeout(Duration::from_secs(20), server).await {
        warn!(error = %e, "api server did not stop in time");
    }
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
            warn!("component loop did not stop in time");
        }
    }
    info!("clean shutdown");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
