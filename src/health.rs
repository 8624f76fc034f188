//! Health probing and bounded polling

use std::future::Future;
use tokio::time::{Duration, Instant, sleep};

/// Poll `check` every `interval` until it returns true or `timeout` elapses
///
/// The first check runs immediately. Returns whether the condition was met.
pub async fn wait_until<F, Fut>(check: F, interval: Duration, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_until_with(check, interval, timeout, |_| {}).await
}

/// [`wait_until`] with a callback after every failed attempt (1-based)
pub async fn wait_until_with<F, Fut, P>(
    mut check: F,
    interval: Duration,
    timeout: Duration,
    mut on_attempt: P,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    P: FnMut(u32),
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if check().await {
            return true;
        }
        on_attempt(attempt);

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// HTTP liveness probe against a llama-server `/health` endpoint
#[derive(Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when `GET {base_url}/health` answers 2xx within the timeout
    pub async fn is_healthy(&self, base_url: &str) -> bool {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }

    /// Poll until healthy or `timeout`
    pub async fn wait_ready(&self, base_url: &str, interval: Duration, timeout: Duration) -> bool {
        wait_until(|| self.is_healthy(base_url), interval, timeout).await
    }
}
