//! Watchdog: periodic liveness checks with automatic recovery
//!
//! ```text
//! Monitoring -> FailureCounting -> Restarting -> Backoff -> Monitoring
//! ```
//!
//! A healthy check from any state resets the failure count and backoff.
//! Restarts go through [`LlamaServer::relaunch`], which shares the server's
//! lifecycle lock with swaps.

use crate::config::WatchdogConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::health::HealthProbe;
use crate::server::LlamaServer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Called before each restart with `(reason, attempt)`
pub type RestartObserver = Arc<dyn Fn(&str, u32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    Stopped,
    Monitoring,
    FailureCounting,
    Restarting,
    Backoff,
}

/// Restart statistics
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStats {
    pub started_at: Option<DateTime<Utc>>,
    /// Restart attempts, successful or not
    pub total_restarts: u32,
    pub successful_restarts: u32,
    pub failed_restarts: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub last_restart_reason: Option<String>,
    pub consecutive_failures: u32,
    pub current_backoff: Duration,
    pub is_healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
}

/// Exponential backoff between restart attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Multiply, capped at the maximum
    pub fn grow(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Inner {
    state: WatchdogState,
    stats: WatchdogStats,
    backoff: Backoff,
    token: Option<CancellationToken>,
}

/// Liveness monitor bound to one [`LlamaServer`]
pub struct Watchdog {
    server: Arc<LlamaServer>,
    config: WatchdogConfig,
    probe: HealthProbe,
    inner: RwLock<Inner>,
    observer: RwLock<Option<RestartObserver>>,
}

impl Watchdog {
    pub fn new(server: Arc<LlamaServer>, config: WatchdogConfig) -> Self {
        let backoff = Backoff::new(
            config.initial_backoff(),
            config.max_backoff(),
            config.backoff_multiplier,
        );
        Self {
            server,
            probe: HealthProbe::new(config.health_timeout()),
            inner: RwLock::new(Inner {
                state: WatchdogState::Stopped,
                stats: WatchdogStats {
                    started_at: None,
                    total_restarts: 0,
                    successful_restarts: 0,
                    failed_restarts: 0,
                    last_restart_at: None,
                    last_restart_reason: None,
                    consecutive_failures: 0,
                    current_backoff: backoff.current(),
                    is_healthy: false,
                    last_health_check: None,
                    last_healthy_at: None,
                },
                backoff,
                token: None,
            }),
            observer: RwLock::new(None),
            config,
        }
    }

    pub async fn set_restart_observer(&self, observer: RestartObserver) {
        *self.observer.write().await = Some(observer);
    }

    /// Launch the monitoring loop
    pub async fn start(self: &Arc<Self>) -> SupervisorResult<()> {
        let token = {
            let mut inner = self.inner.write().await;
            if inner.token.is_some() {
                return Err(SupervisorError::WatchdogAlreadyRunning);
            }
            let token = CancellationToken::new();
            inner.token = Some(token.clone());
            inner.state = WatchdogState::Monitoring;
            inner.stats.started_at = Some(Utc::now());
            token
        };

        tracing::info!(
            interval_ms = self.config.check_interval_ms,
            max_failures = self.config.max_failures,
            max_restarts = self.config.max_restarts,
            "Watchdog started"
        );

        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.monitor(token).await });
        Ok(())
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.write().await;
        if let Some(token) = inner.token.take() {
            token.cancel();
            inner.state = WatchdogState::Stopped;
            tracing::info!("Watchdog stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.token.is_some()
    }

    pub async fn state(&self) -> WatchdogState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> WatchdogStats {
        self.inner.read().await.stats.clone()
    }

    /// Operator-triggered restart, bypassing failure counting
    pub async fn force_restart(&self, reason: &str) -> SupervisorResult<()> {
        tracing::info!(reason = %reason, "Manual restart requested");
        let result = self.restart_server(None).await;
        self.record_restart(&format!("Manual: {}", reason), &result)
            .await;
        result
    }

    async fn monitor(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.check_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let healthy = self.check_health().await;
            {
                let mut inner = self.inner.write().await;
                let now = Utc::now();
                inner.stats.last_health_check = Some(now);
                inner.stats.is_healthy = healthy;
                if healthy {
                    inner.stats.last_healthy_at = Some(now);
                }
            }

            if healthy {
                if failures > 0 {
                    tracing::info!(failures, "llama-server reachable again");
                }
                failures = 0;
                let mut inner = self.inner.write().await;
                inner.backoff.reset();
                inner.stats.current_backoff = inner.backoff.current();
                inner.stats.consecutive_failures = 0;
                inner.state = WatchdogState::Monitoring;
                continue;
            }

            failures += 1;
            crate::metrics::record_health_check_failure();
            {
                let mut inner = self.inner.write().await;
                inner.stats.consecutive_failures = failures;
                inner.state = WatchdogState::FailureCounting;
            }
            tracing::warn!(
                failures,
                max_failures = self.config.max_failures,
                "Health check failed"
            );

            if failures >= self.config.max_failures {
                self.handle_server_down("Health check failed", &token).await;
                failures = 0;
            }
        }

        tracing::debug!("Watchdog monitor exited");
    }

    async fn check_health(&self) -> bool {
        if !self.server.is_running().await {
            return false;
        }
        let url = self.server.base_url().await;
        self.probe.is_healthy(&url).await
    }

    async fn handle_server_down(&self, reason: &str, token: &CancellationToken) {
        let (attempts, backoff) = {
            let inner = self.inner.read().await;
            (inner.stats.total_restarts, inner.backoff.current())
        };

        let max = self.config.max_restarts;
        if max > 0 && attempts >= max {
            tracing::error!(
                error = %SupervisorError::WatchdogExhausted(max),
                "Watchdog giving up"
            );
            self.stop().await;
            return;
        }

        tracing::warn!(reason = %reason, attempt = attempts + 1, "llama-server restart required");

        let observer = self.observer.read().await.clone();
        if let Some(observer) = observer {
            observer(reason, attempts + 1);
        }

        if attempts > 0 {
            self.inner.write().await.state = WatchdogState::Backoff;
            tracing::info!(backoff_ms = backoff.as_millis() as u64, "Waiting before restart");
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let result = self.restart_server(Some(token)).await;
        self.record_restart(reason, &result).await;
    }

    async fn restart_server(&self, token: Option<&CancellationToken>) -> SupervisorResult<()> {
        self.inner.write().await.state = WatchdogState::Restarting;

        let model_path = self
            .server
            .model_path()
            .await
            .ok_or(SupervisorError::NoModelLoaded)?;

        tracing::info!(model = ?model_path, "Watchdog restarting llama-server");
        self.server
            .relaunch(&model_path, self.config.restart_settle())
            .await?;

        let timeout = self.config.ready_timeout();
        let ready = match token {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(SupervisorError::NotRunning),
                ready = self.server.wait_until_ready(timeout) => ready,
            },
            None => self.server.wait_until_ready(timeout).await,
        };

        if ready {
            Ok(())
        } else {
            Err(SupervisorError::HealthTimeout(timeout))
        }
    }

    async fn record_restart(&self, reason: &str, result: &SupervisorResult<()>) {
        let mut inner = self.inner.write().await;
        inner.stats.total_restarts += 1;
        inner.stats.last_restart_at = Some(Utc::now());
        inner.stats.last_restart_reason = Some(reason.to_string());
        inner.stats.consecutive_failures = 0;

        match result {
            Ok(()) => {
                inner.stats.successful_restarts += 1;
                inner.backoff.reset();
                tracing::info!(attempt = inner.stats.total_restarts, "llama-server restarted");
            }
            Err(e) => {
                inner.stats.failed_restarts += 1;
                let next = inner.backoff.grow();
                tracing::error!(
                    error = %e,
                    next_backoff_ms = next.as_millis() as u64,
                    "llama-server restart failed"
                );
            }
        }
        inner.stats.current_backoff = inner.backoff.current();
        if inner.token.is_some() {
            inner.state = WatchdogState::Monitoring;
        }
        crate::metrics::record_watchdog_restart(result.is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::RuntimeAssets;
    use crate::config::ServerConfig;
    use crate::gpu::mocks::StaticGpu;
    use crate::process::mocks::MockProcessManager;
    use httpmock::prelude::*;
    use std::sync::Mutex;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0);
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert_eq!(backoff.grow(), Duration::from_secs(2));
        assert_eq!(backoff.grow(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.grow();
        }
        assert_eq!(backoff.current(), Duration::from_secs(60));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            check_interval_ms: 20,
            max_failures: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            health_timeout_ms: 200,
            ready_timeout_secs: 2,
            restart_settle_ms: 0,
            ..Default::default()
        }
    }

    fn server_on(port: u16, manager: Arc<MockProcessManager>, dir: &std::path::Path) -> Arc<LlamaServer> {
        let config = ServerConfig {
            port,
            data_dir: dir.to_path_buf(),
            stop_settle_ms: 0,
            health_timeout_ms: 200,
            ..Default::default()
        };
        let assets = RuntimeAssets::new(dir.join("llama-server"), dir.to_path_buf());
        Arc::new(LlamaServer::with_components(
            config,
            Some(assets),
            manager,
            Arc::new(StaticGpu::new(24_000, 20_000)),
        ))
    }

    #[tokio::test]
    async fn test_start_twice() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_on(1, Arc::new(MockProcessManager::new()), dir.path());
        let watchdog = Arc::new(Watchdog::new(server, fast_config()));

        watchdog.start().await.unwrap();
        assert!(matches!(
            watchdog.start().await,
            Err(SupervisorError::WatchdogAlreadyRunning)
        ));
        assert_eq!(watchdog.state().await, WatchdogState::Monitoring);

        watchdog.stop().await;
        assert!(!watchdog.is_running().await);
        assert_eq!(watchdog.state().await, WatchdogState::Stopped);
    }

    #[tokio::test]
    async fn test_recovers_crashed_process() {
        let http = MockServer::start_async().await;
        http.mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("a.gguf");
        std::fs::write(&model, b"gguf").unwrap();

        let manager = Arc::new(MockProcessManager::new());
        let server = server_on(http.port(), manager.clone(), dir.path());
        server.start(&model).await.unwrap();

        let watchdog = Arc::new(Watchdog::new(server.clone(), fast_config()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watchdog
            .set_restart_observer(Arc::new(move |reason, attempt| {
                sink.lock().unwrap().push((reason.to_string(), attempt));
            }))
            .await;
        watchdog.start().await.unwrap();

        manager.crash_all().await;

        let restarted = crate::health::wait_until(
            || {
                let watchdog = watchdog.clone();
                async move { watchdog.stats().await.successful_restarts == 1 }
            },
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await;
        assert!(restarted);
        assert!(server.is_running().await);
        assert_eq!(manager.spawned().await.len(), 2);
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![("Health check failed".to_string(), 1)]
        );

        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("a.gguf");
        std::fs::write(&model, b"gguf").unwrap();

        let manager = Arc::new(MockProcessManager::new());
        let server = server_on(1, manager.clone(), dir.path());
        server.start(&model).await.unwrap();
        manager.set_fail_spawns(true);

        let config = WatchdogConfig {
            max_restarts: 2,
            max_failures: 1,
            ..fast_config()
        };
        let watchdog = Arc::new(Watchdog::new(server, config));
        watchdog.start().await.unwrap();

        let stopped = crate::health::wait_until(
            || {
                let watchdog = watchdog.clone();
                async move { !watchdog.is_running().await }
            },
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await;
        assert!(stopped);

        let stats = watchdog.stats().await;
        assert_eq!(stats.total_restarts, 2);
        assert_eq!(stats.failed_restarts, 2);
        // 10ms -> 20ms -> 40ms
        assert_eq!(stats.current_backoff, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_healthy_check_resets_backoff() {
        let http = MockServer::start_async().await;
        http.mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("a.gguf");
        std::fs::write(&model, b"gguf").unwrap();

        let manager = Arc::new(MockProcessManager::new());
        let server = server_on(http.port(), manager.clone(), dir.path());
        server.start(&model).await.unwrap();

        let config = WatchdogConfig {
            check_interval_ms: 200,
            max_failures: 1,
            ..fast_config()
        };
        let watchdog = Arc::new(Watchdog::new(server.clone(), config));
        manager.crash_all().await;
        manager.set_fail_spawns(true);
        watchdog.start().await.unwrap();

        let failed = crate::health::wait_until(
            || {
                let watchdog = watchdog.clone();
                async move { watchdog.stats().await.failed_restarts >= 1 }
            },
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await;
        assert!(failed);
        assert_eq!(
            watchdog.stats().await.current_backoff,
            Duration::from_millis(20)
        );

        // Brought back out-of-band before the next check
        manager.set_fail_spawns(false);
        server.start(&model).await.unwrap();

        let reset = crate::health::wait_until(
            || {
                let watchdog = watchdog.clone();
                async move {
                    let stats = watchdog.stats().await;
                    stats.is_healthy && stats.current_backoff == Duration::from_millis(10)
                }
            },
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await;
        assert!(reset);

        let stats = watchdog.stats().await;
        assert_eq!(stats.successful_restarts, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(watchdog.state().await, WatchdogState::Monitoring);

        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_force_restart_counts() {
        let http = MockServer::start_async().await;
        http.mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("a.gguf");
        std::fs::write(&model, b"gguf").unwrap();

        let manager = Arc::new(MockProcessManager::new());
        let server = server_on(http.port(), manager.clone(), dir.path());
        server.start(&model).await.unwrap();

        let watchdog = Watchdog::new(server, fast_config());
        watchdog.force_restart("config change").await.unwrap();

        let stats = watchdog.stats().await;
        assert_eq!(stats.total_restarts, 1);
        assert_eq!(stats.successful_restarts, 1);
        assert_eq!(
            stats.last_restart_reason.as_deref(),
            Some("Manual: config change")
        );
        assert_eq!(manager.spawned().await.len(), 2);
    }

    #[tokio::test]
    async fn test_force_restart_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_on(1, Arc::new(MockProcessManager::new()), dir.path());
        let watchdog = Watchdog::new(server, fast_config());

        assert!(matches!(
            watchdog.force_restart("test").await,
            Err(SupervisorError::NoModelLoaded)
        ));
        assert_eq!(watchdog.stats().await.failed_restarts, 1);
    }
}
