use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stratum_cache::CacheStore;
use stratum_config::{ConfigLoader, StratumConfig};
use stratum_events::EventBus;
use stratum_fsops::{ArchiveHandler, TransferHandler};
use stratum_queue::{OperationQueue, OperationRouter, QueueSettings, SubmitOptions};
use stratum_staging::StagingController;
use stratum_telemetry::{LogFormat, LoggingConfig, Metrics, build_sha};
use tracing::{info, warn};

use crate::cli::{Cli, read_payload};
use crate::error::{AppError, AppResult};

const IDLE_CHECK: Duration = Duration::from_millis(200);

/// Explicitly constructed service graph.
pub struct Services {
    /// Effective configuration.
    pub config: StratumConfig,
    /// Process-wide event bus.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Local cache.
    pub cache: Arc<CacheStore>,
    /// HSM staging, when an API URL is configured.
    pub staging: Option<Arc<StagingController>>,
    /// Operation queue with both handler families registered.
    pub queue: Arc<OperationQueue>,
}

impl Services {
    /// Build every service from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error when metrics, the cache, or the staging client cannot
    /// be constructed.
    pub fn build(config: StratumConfig) -> AppResult<Self> {
        let events = EventBus::new();
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;

        let cache = Arc::new(
            CacheStore::open(config.cache.clone())
                .map_err(|err| AppError::cache("cache.open", err))?
                .with_events(events.clone())
                .with_metrics(metrics.clone()),
        );

        let staging = StagingController::from_config(&config.hsm)
            .map_err(|err| AppError::staging("staging.from_config", err))?
            .map(|controller| {
                Arc::new(
                    controller
                        .with_events(events.clone())
                        .with_metrics(metrics.clone()),
                )
            });

        let router = OperationRouter::new()
            .with_handler(Arc::new(ArchiveHandler::from_config(
                &config.storage,
                Arc::clone(&cache),
                staging.clone(),
            )))
            .with_handler(Arc::new(TransferHandler::from_config(
                &config.storage,
                staging.clone(),
            )));
        let queue = Arc::new(
            OperationQueue::new(router, QueueSettings::from_config(&config.queue))
                .with_events(events.clone())
                .with_metrics(metrics.clone()),
        );

        info!(
            locations = config.storage.locations.len(),
            archives = config.storage.archives.len(),
            staging = staging.is_some(),
            max_concurrent = queue.settings().max_concurrent,
            "services ready"
        );
        Ok(Self {
            config,
            events,
            metrics,
            cache,
            staging,
            queue,
        })
    }

    /// Resolve once nothing is queued and every worker has returned.
    pub async fn wait_idle(&self) {
        loop {
            let stats = self.queue.stats();
            if stats.queued == 0 && stats.in_flight == 0 {
                return;
            }
            tokio::time::sleep(IDLE_CHECK).await;
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("cache", &self.cache)
            .field("staging", &self.staging)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Entry point for the Stratum boot sequence.
///
/// # Errors
///
/// Returns an error if configuration, logging, service construction, or a
/// payload submission fails.
pub async fn run_app(cli: Cli) -> AppResult<()> {
    let mut loader = ConfigLoader::from_process_env();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader
        .load()
        .map_err(|err| AppError::config("config.load", err))?;

    let logging = LoggingConfig {
        level: &config.telemetry.level,
        format: config
            .telemetry
            .format
            .as_deref()
            .map_or_else(LogFormat::infer, LogFormat::from_name),
        build_sha: build_sha(),
    };
    stratum_telemetry::init_logging(&logging)
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    info!("stratum bootstrap starting");

    let services = Services::build(config)?;
    for path in &cli.payloads {
        let payload = read_payload(path)?;
        let mut options = SubmitOptions::default().tag("cli");
        if let Some(priority) = cli.priority {
            options = options.priority(priority);
        }
        let id = services
            .queue
            .submit(payload, options)
            .map_err(|err| AppError::queue("queue.submit", err))?;
        info!(operation_id = %id, path = %path.display(), "payload submitted");
    }

    if cli.exit_when_idle {
        let idle = async {
            services.wait_idle().await;
        };
        run_until(&services, idle).await;
    } else {
        run_until(&services, shutdown_signal()).await;
    }
    Ok(())
}

/// Keep the services running until `shutdown` resolves, then stop the queue
/// and wait for in-flight operations.
pub async fn run_until(services: &Services, shutdown: impl Future<Output = ()>) {
    shutdown.await;
    info!("shutdown requested; stopping operation queue");
    services.queue.stop().await;

    let stats = services.queue.stats();
    info!(
        processed = stats.total_processed,
        failed = stats.total_failed,
        bytes = stats.total_bytes_processed,
        queued = stats.queued,
        "operation queue stopped"
    );
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_config::CacheConfiguration;

    #[tokio::test]
    async fn build_without_hsm_skips_staging() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = StratumConfig {
            cache: CacheConfiguration::at(dir.path().join("cache")),
            ..StratumConfig::default()
        };
        let services = Services::build(config)?;
        assert!(services.staging.is_none());
        assert_eq!(services.queue.settings().max_concurrent, 3);
        assert!(services.cache.root().exists());

        run_until(&services, async {}).await;
        assert!(!services.queue.stats().is_processing);
        Ok(())
    }

    #[tokio::test]
    async fn build_with_hsm_without_account_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = StratumConfig {
            cache: CacheConfiguration::at(dir.path().join("cache")),
            ..StratumConfig::default()
        };
        config.hsm.api_url = Some("https://hsm.example/v1".into());
        assert!(matches!(
            Services::build(config),
            Err(AppError::Staging { .. })
        ));
        Ok(())
    }
}
