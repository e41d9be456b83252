use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rollwatch_core::{is_trivial_reference, CancelScope, DeployStatusGetter, Progress, RolloutStatus, TracingProgress, WatchError};
use tracing::{debug, info, warn};

/// Polls a status getter until the rollout is terminal, the timeout passes or the scope ends.
pub struct PollingDeployWatcher {
    getter: Arc<dyn DeployStatusGetter>,
    delay: Duration,
    timeout: Duration,
    progress: Arc<dyn Progress>,
}

impl PollingDeployWatcher {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

    pub fn new(getter: Arc<dyn DeployStatusGetter>) -> Self {
        Self {
            getter,
            delay: Self::DEFAULT_DELAY,
            timeout: Self::DEFAULT_TIMEOUT,
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn watch(&self, scope: &CancelScope, reference: &str) -> Result<(), WatchError> {
        if is_trivial_reference(reference) {
            debug!(reference = %reference, "nothing to wait for");
            return Ok(());
        }
        let scope = scope.with_timeout(self.timeout);
        let mut last: Option<RolloutStatus> = None;
        let mut probes = 0u64;
        info!(reference = %reference, delay_ms = self.delay.as_millis() as u64, timeout_s = self.timeout.as_secs(), "waiting for rollout");

        loop {
            let probe = tokio::select! {
                biased;
                done = scope.done() => return Err(WatchError::from_done(done)),
                res = self.getter.get_deploy_status(&scope, reference) => res,
            };
            probes += 1;
            match probe {
                Err(e) => {
                    counter!("rollwatch_probe_errors_total", 1u64);
                    warn!(reference = %reference, probes, error = %format!("{e:#}"), "deploy status probe failed");
                }
                Ok(RolloutStatus::Complete) => {
                    self.progress.step(&format!("rollout {reference} complete"));
                    info!(reference = %reference, probes, "rollout complete");
                    return Ok(());
                }
                Ok(RolloutStatus::Failed) => {
                    info!(reference = %reference, probes, "rollout failed");
                    return Err(WatchError::Failed(format!("rollout {reference} reported failure")));
                }
                Ok(RolloutStatus::Cancelled) => {
                    return Err(WatchError::Cancelled { reason: "rollout cancelled by platform".to_string() });
                }
                Ok(status) => {
                    if last != Some(status) {
                        self.progress.step(&format!("rollout {reference}: {status}"));
                        last = Some(status);
                    }
                }
            }

            tokio::select! {
                biased;
                done = scope.done() => return Err(WatchError::from_done(done)),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}
