//! Liveness: a periodic self-probe through the handler tree.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use tracing::{debug, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum Probe {
    Ok(Instant),
    Failed(Instant, String),
}

/// Result of the most recent internal `tools/list` probe.
pub struct HealthState {
    last: RwLock<Option<Probe>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            last: RwLock::new(None),
        }
    }

    pub fn record_ok(&self) {
        *self.last.write().expect("lock") = Some(Probe::Ok(Instant::now()));
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        *self.last.write().expect("lock") = Some(Probe::Failed(Instant::now(), error.into()));
    }

    /// 200 when the probe succeeded within the last minute, 503 with the
    /// last error otherwise, 425 before the first probe completes.
    pub fn status(&self) -> (StatusCode, String) {
        match self.last.read().expect("lock").clone() {
            None => (StatusCode::TOO_EARLY, "no health check completed yet".to_string()),
            Some(Probe::Ok(at)) if at.elapsed() <= PROBE_INTERVAL => {
                (StatusCode::OK, "ok".to_string())
            }
            Some(Probe::Ok(at)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("last success {}s ago", at.elapsed().as_secs()),
            ),
            Some(Probe::Failed(_, error)) => (StatusCode::SERVICE_UNAVAILABLE, error),
        }
    }

    /// Run `probe` every minute with a 30 second timeout, recording the
    /// outcome. The future resolves only on cancellation of the runtime.
    pub fn spawn_ticker<F, Fut>(state: &Arc<HealthState>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                interval.tick().await;
                match tokio::time::timeout(PROBE_TIMEOUT, probe()).await {
                    Ok(Ok(())) => {
                        debug!("health probe ok");
                        state.record_ok();
                    }
                    Ok(Err(error)) => {
                        warn!(%error, "health probe failed");
                        state.record_failure(error);
                    }
                    Err(_) => {
                        warn!("health probe timed out");
                        state.record_failure("health probe timed out");
                    }
                }
            }
        });
    }
}
