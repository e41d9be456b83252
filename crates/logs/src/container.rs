use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rollwatch_core::{stream_id, ByteStream, LogMessage, StreamGetter};
use rollwatch_store::{OrderedLogBuffer, Slot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lines::{pump_lines, split_timestamp, PumpEnd};
use crate::LogOptions;

enum Opened {
    Stream(ByteStream),
    Stopped,
    Failed,
}

/// Streams one container's log endpoint into a buffer slot.
#[derive(Clone)]
pub struct ContainerStreamer {
    pod: String,
    container: String,
    source_type: Arc<str>,
    getter: Arc<dyn StreamGetter>,
    stop: CancellationToken,
}

impl ContainerStreamer {
    pub fn new(
        pod: &str,
        container: &str,
        source_type: &str,
        getter: Arc<dyn StreamGetter>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            pod: pod.to_string(),
            container: container.to_string(),
            source_type: Arc::from(source_type),
            getter,
            stop,
        }
    }

    pub fn stream_id(&self) -> String {
        stream_id(&self.pod, &self.container)
    }

    /// Ask the stream to finish; trailing lines are still flushed if configured.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Blocks until stopped or the source is exhausted. Never fails: logs end when the source ends.
    pub async fn stream(&self, opts: &LogOptions, buffer: &OrderedLogBuffer) {
        let id = self.stream_id();
        let slot = buffer.reserve_slot(&id);
        let since = opts.since.unwrap_or_else(Utc::now);
        let mut last_seen: Option<DateTime<Utc>> = None;
        info!(stream = %id, follow = opts.follow, since = %since, "container log stream starting");

        let end = match self.open(since, opts.follow, opts).await {
            Opened::Stream(bytes) => {
                pump_lines(bytes, &self.stop, |line| self.forward(&slot, line, None, &mut last_seen)).await
            }
            Opened::Stopped => PumpEnd::Stopped,
            Opened::Failed => PumpEnd::Exhausted,
        };

        if end == PumpEnd::Stopped && !opts.stop_flush_timeout.is_zero() {
            self.flush(&slot, last_seen.unwrap_or(since), &mut last_seen, opts.stop_flush_timeout).await;
        }
        if !slot.wait_flushed(opts.release_wait).await {
            debug!(stream = %id, "slot still had queued lines at release");
        }
        slot.release();
        info!(stream = %id, stopped = (end == PumpEnd::Stopped), "container log stream ended");
    }

    async fn open(&self, since: DateTime<Utc>, follow: bool, opts: &LogOptions) -> Opened {
        let mut attempts = 0u32;
        loop {
            let res = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Opened::Stopped,
                r = self.getter.get_stream(&self.pod, &self.container, since, follow) => r,
            };
            match res {
                Ok(bytes) => return Opened::Stream(bytes),
                Err(e) if e.is_not_ready() && attempts < opts.open_retry_limit => {
                    attempts += 1;
                    counter!("rollwatch_open_retries_total", 1u64);
                    debug!(pod = %self.pod, container = %self.container, attempts, error = %e, "container not ready; retrying");
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => return Opened::Stopped,
                        _ = tokio::time::sleep(opts.open_retry_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(pod = %self.pod, container = %self.container, attempts, error = %e, "container log stream failed to open");
                    return Opened::Failed;
                }
            }
        }
    }

    /// Re-read lines written between the stop signal and container exit.
    async fn flush(&self, slot: &Slot, from: DateTime<Utc>, last_seen: &mut Option<DateTime<Utc>>, timeout: Duration) {
        let cutoff = *last_seen;
        let run = async {
            let bytes = match self.getter.get_stream(&self.pod, &self.container, from, true).await {
                Ok(b) => b,
                Err(e) => {
                    debug!(pod = %self.pod, container = %self.container, error = %e, "stop flush could not reopen stream");
                    return;
                }
            };
            // Only the timeout ends the flush.
            let never = CancellationToken::new();
            pump_lines(bytes, &never, |line| self.forward(slot, line, cutoff, last_seen)).await;
        };
        if tokio::time::timeout(timeout, run).await.is_err() {
            debug!(pod = %self.pod, container = %self.container, "stop flush window elapsed");
        }
    }

    fn forward(&self, slot: &Slot, line: &str, cutoff: Option<DateTime<Utc>>, last_seen: &mut Option<DateTime<Utc>>) {
        let (ts, text) = split_timestamp(line);
        if let (Some(ts), Some(cutoff)) = (ts, cutoff) {
            if ts <= cutoff {
                return;
            }
        }
        let ts = ts.unwrap_or_else(Utc::now);
        if last_seen.map_or(true, |seen| ts > seen) {
            *last_seen = Some(ts);
        }
        slot.emit(LogMessage::new(self.source_type.as_ref(), self.pod.as_str(), self.stream_id(), ts, text));
    }
}
