use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use crate::upload::{GATEWAY_POLL_INTERVAL, GATEWAY_READY_TIMEOUT, GatewayProbe, Result, UploadError};

/// Shell-side lookup of the local gateway.
#[async_trait]
pub trait GatewayLocator: Send + Sync {
    /// `None` while the gateway is still starting.
    async fn gateway_url(&self) -> Result<Option<String>>;

    /// Pushes the current backend URL and token to the gateway. Called every
    /// time readiness is confirmed.
    async fn sync_config(&self) -> Result<()> {
        Ok(())
    }
}

/// Polls a [`GatewayLocator`] until the gateway answers, then caches its URL.
///
/// Concurrent callers wait on the same poll. A timed-out poll is not cached,
/// the next call starts over.
pub struct GatewayReadiness {
    locator: Arc<dyn GatewayLocator>,
    timeout: Duration,
    poll_interval: Duration,
    cached: Mutex<Option<String>>,
}

impl GatewayReadiness {
    pub fn new(locator: Arc<dyn GatewayLocator>) -> Self {
        Self {
            locator,
            timeout: GATEWAY_READY_TIMEOUT,
            poll_interval: GATEWAY_POLL_INTERVAL,
            cached: Mutex::new(None),
        }
    }

    pub fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// URL found by an earlier successful poll.
    pub async fn cached_url(&self) -> Option<String> {
        self.cached.lock().await.clone()
    }

    /// Forgets the cached URL, e.g. after the shell restarted the gateway.
    pub async fn reset(&self) {
        self.cached.lock().await.take();
    }

    async fn poll(&self) -> Result<String> {
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.locator.gateway_url().await {
                Ok(Some(url)) if !url.trim().is_empty() => {
                    return Ok(url.trim().trim_end_matches('/').to_string());
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "gateway lookup failed"),
            }

            if Instant::now() >= deadline {
                return Err(UploadError::GatewayUnavailable(
                    "Local gateway is not ready, please try again later".to_string(),
                ));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn sync(&self) {
        if let Err(err) = self.locator.sync_config().await {
            warn!(error = %err, "failed to sync gateway config");
        }
    }
}

#[async_trait]
impl GatewayProbe for GatewayReadiness {
    async fn ensure_ready(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        let url = match cached.as_ref() {
            Some(url) => url.clone(),
            None => {
                let url = self.poll().await?;
                info!(gateway = %url, "desktop gateway ready");
                *cached = Some(url.clone());
                url
            }
        };
        drop(cached);

        self.sync().await;
        Ok(url)
    }
}
