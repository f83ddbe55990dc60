//! Pipeline worker binary.
//!
//! Runs the recovery and publishing triggers on a fixed interval. Deployments
//! that drive the triggers through the API's cron endpoints do not need it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reelsmith_models::TriggerSummary;
use reelsmith_store::{KvStore, RedisStore};
use reelsmith_worker::{
    Collaborators, FailureTracker, HttpStudio, LogNotifier, Notifier, PipelineService,
    WebhookNotifier, WorkerConfig, WorkerResult,
};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reelsmith=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

fn report(
    queue: &str,
    result: WorkerResult<TriggerSummary>,
    failures: &mut FailureTracker,
) {
    match result {
        Ok(summary) => {
            failures.record_success();
            if summary.processed_count > 0 || summary.budget_exhausted {
                info!(
                    queue,
                    processed = summary.processed_count,
                    remaining = summary.remaining_count,
                    budget_exhausted = summary.budget_exhausted,
                    "Trigger tick"
                );
            }
        }
        Err(e) if e.is_already_processing() => warn!(queue, "Trigger still running, skipping tick"),
        Err(e) => {
            if failures.record_failure() {
                error!(queue, error = %e, "Trigger failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TLS for the studio gateway and webhook calls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting reelsmith-worker");

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("invalid METRICS_ADDR")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Metrics exporter listening");
    }

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let kv: Arc<dyn KvStore> = Arc::new(RedisStore::from_env().context("failed to create store")?);
    let studio = Arc::new(HttpStudio::from_env().context("failed to create studio client")?);
    let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_env() {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(LogNotifier),
    };

    let service = PipelineService::new(
        kv,
        Collaborators {
            studio: studio.clone(),
            publisher: studio,
            notifier,
        },
        config.clone(),
    );

    let mut ticker = tokio::time::interval(config.trigger_interval);
    let mut recovery_failures = FailureTracker::new(5);
    let mut publish_failures = FailureTracker::new(5);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // The queues are independent; drain both concurrently
                let now = Utc::now();
                let (recovery, publishing) = futures::join!(
                    service.run_due_recovery(now),
                    service.run_due_publishing(now),
                );
                report("recovery", recovery, &mut recovery_failures);
                report("publishing", publishing, &mut publish_failures);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
