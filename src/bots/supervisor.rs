//! Worker supervision: staggered startup, shared infrastructure wiring,
//! health aggregation, and graceful shutdown.
//!
//! The supervisor owns every process-wide resource — HTTP client, rate
//! limiter, circuit breaker, volume cache, dedup store — and hands the
//! workers `Arc`s. Shutdown cancels one token; workers drain within a
//! bounded grace period.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::strategy::StrategyKind;
use super::worker::{
    FlowScanner, HealthState, MetricsSnapshot, Scanner, StratScanner, Worker, WorkerMetrics,
};
use crate::alerts::dedup::DedupStore;
use crate::alerts::webhook::{AlertSink, DiscordWebhook};
use crate::config::Config;
use crate::data::limiter::{CircuitBreaker, TokenBucket};
use crate::data::polygon::{ClientOptions, PolygonClient};
use crate::data::store::SignalStore;
use crate::data::transport::ReqwestTransport;
use crate::data::volume::VolumeDeltaCache;
use crate::engine::bars::trading_date_et;
use crate::engine::flow::FlowDetector;

const START_STAGGER: Duration = Duration::from_secs(5);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct WorkerInfo {
    name: String,
    metrics: Arc<Mutex<WorkerMetrics>>,
    health: Arc<Mutex<HealthState>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub health: HealthState,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

pub struct Supervisor {
    infos: Arc<Vec<WorkerInfo>>,
    joins: Vec<(String, JoinHandle<()>)>,
    cancel: CancellationToken,
    store: Option<Arc<SignalStore>>,
}

impl Supervisor {
    /// Build shared infrastructure and launch one worker per configured
    /// bot, staggered to smooth startup load.
    pub async fn start(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();

        let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
        let limiter = Arc::new(TokenBucket::new(config.rate_limit_per_sec));
        let breaker = Arc::new(CircuitBreaker::with_defaults());
        let client = Arc::new(PolygonClient::new(
            transport,
            limiter,
            breaker,
            ClientOptions {
                base_url: config.base_url.clone(),
                api_key: config.api_key.clone(),
                retry_attempts: config.retry_attempts,
                retry_delay: config.retry_delay,
            },
        ));
        let volumes = Arc::new(VolumeDeltaCache::new());
        let detector = Arc::new(FlowDetector::new(client.clone(), volumes.clone()));

        let store = match &config.database_url {
            None => None,
            Some(url) => match SignalStore::open(url) {
                Ok(s) => {
                    tracing::info!(path = %url, "alert store opened");
                    Some(Arc::new(s))
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "alert store unavailable, falling back to in-memory dedup"
                    );
                    None
                }
            },
        };
        let dedup = Arc::new(DedupStore::new(
            config.flow_cooldown,
            store.clone(),
            trading_date_et(chrono::Utc::now()),
        ));

        let mut infos = Vec::new();
        let mut joins = Vec::new();
        for (index, bot) in config.bots.iter().enumerate() {
            let sink: Arc<dyn AlertSink> =
                Arc::new(DiscordWebhook::new(bot.webhook_url.clone())?);
            let scanner: Arc<dyn Scanner> = match bot.strategy {
                StrategyKind::Strat => Arc::new(StratScanner::new(
                    client.clone(),
                    dedup.clone(),
                    store.clone(),
                )),
                kind => {
                    let cascade = bot
                        .cascade
                        .clone()
                        .context("flow bot missing filter cascade")?;
                    let thresholds = bot
                        .flow
                        .clone()
                        .context("flow bot missing detector thresholds")?;
                    Arc::new(FlowScanner::new(
                        kind,
                        detector.clone(),
                        cascade,
                        thresholds,
                        dedup.clone(),
                    ))
                }
            };

            let worker = Worker::new(
                bot.strategy,
                config.watchlist.clone(),
                bot.interval,
                config.max_concurrent_requests,
                scanner,
                sink,
                cancel.clone(),
            );
            infos.push(WorkerInfo {
                name: worker.name().to_string(),
                metrics: worker.metrics_handle(),
                health: worker.health_handle(),
            });

            let stagger = START_STAGGER * index as u32;
            let child_cancel = cancel.clone();
            let name = worker.name().to_string();
            joins.push((
                name,
                tokio::spawn(async move {
                    tokio::select! {
                        () = child_cancel.cancelled() => return,
                        () = tokio::time::sleep(stagger) => {}
                    }
                    worker.run().await;
                }),
            ));
        }

        // Janitor: periodic cache eviction and the daily ET dedup reset.
        {
            let client = client.clone();
            let volumes = volumes.clone();
            let dedup = dedup.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(60)) => {
                            client.purge_cache();
                            volumes.evict_idle();
                            dedup.purge_cooldowns();
                            dedup.maybe_daily_reset(trading_date_et(chrono::Utc::now()));
                        }
                    }
                }
            });
        }

        let infos = Arc::new(infos);
        if let Some(port) = config.health_port {
            spawn_health_server(port, infos.clone(), cancel.clone()).await?;
        }

        Ok(Self {
            infos,
            joins,
            cancel,
            store,
        })
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        worker_statuses(&self.infos)
    }

    /// Cancel every worker and await completion within the grace period.
    pub async fn shutdown(self, grace: Duration) {
        tracing::info!("supervisor shutting down");
        self.cancel.cancel();
        for (name, join) in self.joins {
            match tokio::time::timeout(grace, join).await {
                Ok(Ok(())) => tracing::info!(worker = %name, "worker stopped"),
                Ok(Err(e)) => tracing::warn!(worker = %name, error = %e, "worker task failed"),
                Err(_) => {
                    tracing::warn!(worker = %name, "worker exceeded shutdown grace period");
                }
            }
        }
        if self.store.is_some() {
            // SQLite commits per statement; nothing buffered to flush.
            tracing::info!("alert store closed");
        }
    }
}

fn worker_statuses(infos: &[WorkerInfo]) -> Vec<WorkerStatus> {
    infos
        .iter()
        .map(|info| WorkerStatus {
            name: info.name.clone(),
            health: *info.health.lock().expect("health lock poisoned"),
            metrics: info
                .metrics
                .lock()
                .expect("metrics lock poisoned")
                .snapshot(),
        })
        .collect()
}

/// `ok` while every worker is starting/healthy; `degraded` if any worker is
/// degraded; `stopped` once all workers have stopped.
fn aggregate_health(statuses: &[WorkerStatus]) -> serde_json::Value {
    let overall = if !statuses.is_empty()
        && statuses.iter().all(|s| s.health == HealthState::Stopped)
    {
        "stopped"
    } else if statuses.iter().any(|s| s.health == HealthState::Degraded) {
        "degraded"
    } else {
        "ok"
    };
    serde_json::json!({
        "status": overall,
        "workers": statuses
            .iter()
            .map(|s| (s.name.clone(), s.health))
            .collect::<std::collections::BTreeMap<_, _>>(),
    })
}

async fn spawn_health_server(
    port: u16,
    infos: Arc<Vec<WorkerInfo>>,
    cancel: CancellationToken,
) -> Result<()> {
    let health_infos = infos.clone();
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let infos = health_infos.clone();
                async move { Json(aggregate_health(&worker_statuses(&infos))) }
            }),
        )
        .route(
            "/metrics",
            get(move || {
                let infos = infos.clone();
                async move { Json(worker_statuses(&infos)) }
            }),
        );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding health endpoint on port {port}"))?;
    tracing::info!(port, "health endpoint listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::warn!(error = %e, "health server error");
        }
    });
    Ok(())
}
