//! Staging controller: makes tape-resident files readable.
//!
//! # Design
//! - Residency is queried on demand and never cached; only the filesystem
//!   table is cached for the controller's lifetime.
//! - Waits poll with a doubling delay bounded by `max_poll_interval` and by the
//!   remaining deadline, and observe a [`CancelSignal`] at every iteration.
//! - Every HSM call made during a wait is itself bounded by the deadline and
//!   interrupted by cancellation.
//! - Outcomes are published on the event bus and counted in metrics when
//!   those sinks are attached.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stratum_config::HsmConfig;
use stratum_config::defaults;
use stratum_core::CancelSignal;
use stratum_events::{Event, EventBus};
use stratum_telemetry::Metrics;
use tokio::sync::OnceCell;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::api::{BlockStatus, Filesystem, HsmApi};
use crate::client::HsmClient;
use crate::error::{StagingError, StagingResult};
use crate::resolve::resolve_filesystem;

const STAGE_COMMAND: &str = "stage";

/// Timing knobs for staging waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingSettings {
    /// Deadline used when a caller passes no explicit timeout.
    pub stage_timeout: Duration,
    /// First delay between residency polls.
    pub poll_interval: Duration,
    /// Ceiling for the doubling poll delay.
    pub max_poll_interval: Duration,
}

impl StagingSettings {
    /// Read the timing knobs from the `hsm` section.
    #[must_use]
    pub const fn from_config(config: &HsmConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            poll_interval: config.poll_interval(),
            max_poll_interval: config.max_poll_interval(),
        }
    }
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(defaults::STAGE_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            max_poll_interval: Duration::from_millis(defaults::MAX_POLL_INTERVAL_MS),
        }
    }
}

/// Brings HSM-managed files online before they are read.
pub struct StagingController {
    api: Arc<dyn HsmApi>,
    settings: StagingSettings,
    filesystems: OnceCell<Vec<Filesystem>>,
    events: Option<EventBus>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for StagingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingController")
            .field("settings", &self.settings)
            .field("filesystems", &self.filesystems.get())
            .finish_non_exhaustive()
    }
}

impl StagingController {
    /// Wrap an API binding.
    #[must_use]
    pub fn new(api: Arc<dyn HsmApi>, settings: StagingSettings) -> Self {
        Self {
            api,
            settings,
            filesystems: OnceCell::new(),
            events: None,
            metrics: None,
        }
    }

    /// Build a controller backed by [`HsmClient`], or `None` when no API URL is configured.
    ///
    /// # Errors
    ///
    /// Propagates client construction failures.
    pub fn from_config(config: &HsmConfig) -> StagingResult<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }
        let client = HsmClient::from_config(config)?;
        Ok(Some(Self::new(
            Arc::new(client),
            StagingSettings::from_config(config),
        )))
    }

    /// Publish staging outcomes on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Count staging outcomes in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Active timing knobs.
    #[must_use]
    pub const fn settings(&self) -> StagingSettings {
        self.settings
    }

    /// Filesystem table, fetched on first use.
    ///
    /// # Errors
    ///
    /// Propagates API failures from the first fetch.
    pub async fn filesystems(&self) -> StagingResult<&[Filesystem]> {
        let table = self
            .filesystems
            .get_or_try_init(|| async {
                let table = self.api.filesystems().await?;
                debug!(count = table.len(), "hsm filesystem table loaded");
                Ok::<_, StagingError>(table)
            })
            .await?;
        Ok(table.as_slice())
    }

    /// Identifier of the filesystem that serves `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::AmbiguousFilesystem`] when resolution is not unique.
    pub async fn resolve(&self, path: &str) -> StagingResult<String> {
        let table = self.filesystems().await?;
        Ok(resolve_filesystem(path, table)?.fsid.clone())
    }

    /// Current block residency of `path`.
    ///
    /// # Errors
    ///
    /// Propagates resolution and API failures.
    pub async fn status(&self, path: &str) -> StagingResult<BlockStatus> {
        let fsid = self.resolve(path).await?;
        self.api.file_status(&fsid, path).await
    }

    /// Whether every block of `path` is resident.
    ///
    /// # Errors
    ///
    /// Propagates resolution and API failures.
    pub async fn is_online(&self, path: &str) -> StagingResult<bool> {
        Ok(self.status(path).await?.is_online())
    }

    /// Ask the HSM to stage `path`. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Propagates resolution and API failures.
    pub async fn stage(&self, path: &str) -> StagingResult<()> {
        let fsid = self.resolve(path).await?;
        self.request_stage(&fsid, path).await
    }

    /// Raw `/queues` document from the HSM.
    ///
    /// # Errors
    ///
    /// Propagates API failures.
    pub async fn queues(&self) -> StagingResult<Value> {
        self.api.queues().await
    }

    /// Return once `path` is fully online, staging it first if needed.
    ///
    /// `timeout` defaults to the configured stage timeout. Returns the time
    /// spent waiting.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Timeout`] at the deadline,
    /// [`StagingError::Cancelled`] when `cancel` fires, and propagates
    /// resolution and API failures.
    pub async fn ensure_online(
        &self,
        path: &str,
        timeout: Option<Duration>,
        cancel: CancelSignal,
    ) -> StagingResult<Duration> {
        let timeout = timeout.unwrap_or(self.settings.stage_timeout);
        let result = self.wait_online(path, timeout, cancel).await;
        self.record(path, &result);
        result
    }

    async fn wait_online(
        &self,
        path: &str,
        timeout: Duration,
        cancel: CancelSignal,
    ) -> StagingResult<Duration> {
        if cancel.is_cancelled() {
            return Err(cancelled(path));
        }
        let started = Instant::now();
        let mut wait = Wait {
            path,
            started,
            deadline: started + timeout,
            cancel,
        };
        let fsid = wait.bounded(self.resolve(path)).await?;

        if wait.bounded(self.api.file_status(&fsid, path)).await?.is_online() {
            debug!(path, "file already online");
            return Ok(Duration::ZERO);
        }
        wait.bounded(self.request_stage(&fsid, path)).await?;

        let mut delay = self.settings.poll_interval;
        loop {
            let now = Instant::now();
            if now >= wait.deadline {
                return Err(timed_out(path, started));
            }
            let nap = delay.min(wait.deadline - now);
            tokio::select! {
                () = sleep(nap) => {}
                () = wait.cancel.cancelled() => return Err(cancelled(path)),
            }

            let status = wait.bounded(self.api.file_status(&fsid, path)).await?;
            if status.is_online() {
                return Ok(started.elapsed());
            }
            debug!(
                path,
                online_blocks = ?status.online_blocks,
                offline_blocks = ?status.offline_blocks,
                "waiting for file to come online"
            );
            delay = delay.saturating_mul(2).min(self.settings.max_poll_interval);
        }
    }

    async fn request_stage(&self, fsid: &str, path: &str) -> StagingResult<()> {
        self.api.request(STAGE_COMMAND, fsid, path).await?;
        info!(path, fsid, "stage requested");
        if let Some(events) = &self.events {
            events.publish(Event::StagingRequested {
                path: path.to_string(),
                fsid: fsid.to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, path: &str, result: &StagingResult<Duration>) {
        let outcome = match result {
            Ok(_) => "online",
            Err(err) => err.outcome(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.inc_staging_request(outcome);
        }
        let event = match result {
            Ok(waited) => Event::StagingCompleted {
                path: path.to_string(),
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            },
            Err(err) => {
                warn!(path, error = %err, outcome, "staging failed");
                Event::StagingFailed {
                    path: path.to_string(),
                    message: format!("{err}"),
                }
            }
        };
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

/// Deadline and cancellation shared by every step of one staging wait.
struct Wait<'a> {
    path: &'a str,
    started: Instant,
    deadline: Instant,
    cancel: CancelSignal,
}

impl Wait<'_> {
    async fn bounded<T>(
        &mut self,
        call: impl Future<Output = StagingResult<T>>,
    ) -> StagingResult<T> {
        let (path, started) = (self.path, self.started);
        tokio::select! {
            outcome = timeout_at(self.deadline, call) => {
                outcome.unwrap_or_else(|_| Err(timed_out(path, started)))
            }
            () = self.cancel.cancelled() => Err(cancelled(path)),
        }
    }
}

fn timed_out(path: &str, started: Instant) -> StagingError {
    StagingError::Timeout {
        path: path.to_string(),
        waited: started.elapsed(),
    }
}

fn cancelled(path: &str) -> StagingError {
    StagingError::Cancelled {
        path: path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stratum_core::cancel_pair;

    struct ScriptedHsm {
        mounts: Vec<Filesystem>,
        epoch: Instant,
        online_after: Option<Duration>,
        status_latency: Duration,
        status_calls: AtomicUsize,
        stage_calls: AtomicUsize,
        fs_calls: AtomicUsize,
    }

    impl ScriptedHsm {
        fn new(online_after: Option<Duration>) -> Arc<Self> {
            Self::answering_after(online_after, Duration::ZERO)
        }

        fn answering_after(online_after: Option<Duration>, status_latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                mounts: vec![Filesystem::new("1", "/hsm"), Filesystem::new("2", "/hsm/deep")],
                epoch: Instant::now(),
                online_after,
                status_latency,
                status_calls: AtomicUsize::new(0),
                stage_calls: AtomicUsize::new(0),
                fs_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HsmApi for ScriptedHsm {
        async fn filesystems(&self) -> StagingResult<Vec<Filesystem>> {
            self.fs_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.mounts.clone())
        }

        async fn file_status(&self, fsid: &str, _path: &str) -> StagingResult<BlockStatus> {
            assert_eq!(fsid, "2");
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if !self.status_latency.is_zero() {
                sleep(self.status_latency).await;
            }
            let online = self
                .online_after
                .is_some_and(|after| self.epoch.elapsed() >= after);
            Ok(if online {
                BlockStatus {
                    online_blocks: Some(4),
                    offline_blocks: Some(0),
                }
            } else {
                BlockStatus {
                    online_blocks: Some(0),
                    offline_blocks: Some(4),
                }
            })
        }

        async fn request(&self, command: &str, _fsid: &str, _path: &str) -> StagingResult<()> {
            assert_eq!(command, STAGE_COMMAND);
            self.stage_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn queues(&self) -> StagingResult<Value> {
            Ok(serde_json::json!({"stage": 0}))
        }
    }

    const PATH: &str = "/hsm/deep/run1/out.nc";

    fn settings(poll_ms: u64, max_ms: u64, timeout_secs: u64) -> StagingSettings {
        StagingSettings {
            stage_timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_millis(poll_ms),
            max_poll_interval: Duration::from_millis(max_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn already_online_returns_without_staging() -> anyhow::Result<()> {
        let hsm = ScriptedHsm::new(Some(Duration::ZERO));
        let controller = StagingController::new(hsm.clone(), settings(1_000, 1_000, 180));

        let waited = controller
            .ensure_online(PATH, None, CancelSignal::never())
            .await?;
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(hsm.stage_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn returns_within_a_poll_of_coming_online() -> anyhow::Result<()> {
        let hsm = ScriptedHsm::new(Some(Duration::from_millis(3_500)));
        let controller = StagingController::new(hsm.clone(), settings(1_000, 1_000, 180));

        let waited = controller
            .ensure_online(PATH, None, CancelSignal::never())
            .await?;
        assert!(waited >= Duration::from_millis(3_500));
        assert!(waited <= Duration::from_millis(4_500));
        assert_eq!(hsm.stage_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_deadline() {
        let hsm = ScriptedHsm::new(None);
        let metrics = Metrics::new().expect("metrics");
        let bus = EventBus::new();
        let controller = StagingController::new(hsm, settings(1_000, 1_000, 180))
            .with_metrics(metrics.clone())
            .with_events(bus.clone());

        let err = controller
            .ensure_online(PATH, Some(Duration::from_secs(10)), CancelSignal::never())
            .await
            .expect_err("never online");
        match err {
            StagingError::Timeout { waited, ref path } => {
                assert_eq!(path, PATH);
                assert!(waited >= Duration::from_secs(10));
                assert!(waited < Duration::from_secs(11));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let rendered = metrics.render().expect("render");
        assert!(rendered.contains("stratum_staging_requests_total{outcome=\"timeout\"} 1"));
        let kinds: Vec<&str> = bus
            .backlog_since(0)
            .iter()
            .map(|envelope| envelope.event.kind())
            .collect();
        assert_eq!(kinds, vec!["staging_requested", "staging_failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_delay_doubles_up_to_the_ceiling() {
        let hsm = ScriptedHsm::new(None);
        let controller = StagingController::new(hsm.clone(), settings(1_000, 4_000, 20));

        let err = controller
            .ensure_online(PATH, None, CancelSignal::never())
            .await
            .expect_err("never online");
        assert!(matches!(err, StagingError::Timeout { .. }));
        // Initial check, then polls at 1, 3, 7, 11, 15, 19 and 20 seconds.
        assert_eq!(hsm.status_calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let hsm = ScriptedHsm::new(None);
        let controller = Arc::new(StagingController::new(hsm, settings(1_000, 1_000, 180)));
        let (handle, signal) = cancel_pair();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.ensure_online(PATH, None, signal).await })
        };
        sleep(Duration::from_millis(2_500)).await;
        handle.cancel();

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(StagingError::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_status_call_is_cut_off_at_the_deadline() {
        let hsm = ScriptedHsm::answering_after(None, Duration::from_secs(30));
        let controller = StagingController::new(hsm.clone(), settings(1_000, 1_000, 5));
        let started = Instant::now();

        let err = controller
            .ensure_online(PATH, None, CancelSignal::never())
            .await
            .expect_err("status never answers in time");
        match err {
            StagingError::Timeout { waited, .. } => {
                assert!(waited >= Duration::from_secs(5));
                assert!(waited < Duration::from_secs(6));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(hsm.stage_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_slow_status_call() {
        let hsm = ScriptedHsm::answering_after(None, Duration::from_secs(30));
        let controller = Arc::new(StagingController::new(hsm, settings(1_000, 1_000, 180)));
        let (handle, signal) = cancel_pair();
        let started = Instant::now();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.ensure_online(PATH, None, signal).await })
        };
        sleep(Duration::from_secs(2)).await;
        handle.cancel();

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(StagingError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_wait_makes_no_calls() {
        let hsm = ScriptedHsm::new(None);
        let controller = StagingController::new(hsm.clone(), StagingSettings::default());
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let result = controller.ensure_online(PATH, None, signal).await;
        assert!(matches!(result, Err(StagingError::Cancelled { .. })));
        assert_eq!(hsm.fs_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn filesystem_table_is_fetched_once() -> anyhow::Result<()> {
        let hsm = ScriptedHsm::new(Some(Duration::ZERO));
        let controller = StagingController::new(hsm.clone(), StagingSettings::default());

        assert_eq!(controller.resolve(PATH).await?, "2");
        assert!(controller.is_online(PATH).await?);
        controller.stage(PATH).await?;
        assert_eq!(controller.queues().await?["stage"], 0);
        assert_eq!(hsm.fs_calls.load(Ordering::SeqCst), 1);

        let err = controller
            .resolve("/other/file.nc")
            .await
            .expect_err("unmounted");
        assert!(matches!(err, StagingError::AmbiguousFilesystem { .. }));
        Ok(())
    }

    #[test]
    fn disabled_config_builds_no_controller() -> anyhow::Result<()> {
        assert!(StagingController::from_config(&HsmConfig::default())?.is_none());
        Ok(())
    }
}
