//! Rollwatch logs: live, merged log streaming for a workload whose pods come
//! and go while it is being watched.
//!
//! `WorkloadStreamer` tracks pods, each pod runs a `PodStreamer`, each
//! container a `ContainerStreamer`; every container writes into its own slot
//! of one `OrderedLogBuffer`.

#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod container;
pub mod lines;
pub mod pod;
pub mod workload;

pub use container::ContainerStreamer;
pub use lines::{pump_lines, split_timestamp, PumpEnd};
pub use pod::PodStreamer;
pub use workload::WorkloadStreamer;

/// Options for a log-streaming session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOptions {
    /// Only lines newer than this; defaults to the moment each container stream opens.
    pub since: Option<DateTime<Utc>>,
    /// Keep streaming new lines (default: true)
    pub follow: bool,
    /// Pod label selector override.
    pub selector: Option<String>,
    /// Extra time given to containers after the session is cancelled.
    pub cancel_flush_timeout: Duration,
    /// Bound on the trailing-lines re-read after a container is stopped; zero disables it.
    pub stop_flush_timeout: Duration,
    pub open_retry_interval: Duration,
    /// Attempts while the container reports it is not ready yet.
    pub open_retry_limit: u32,
    /// How long a finishing container waits for its queued lines to be emitted.
    pub release_wait: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            since: None,
            follow: true,
            selector: None,
            cancel_flush_timeout: Duration::ZERO,
            stop_flush_timeout: Duration::ZERO,
            open_retry_interval: Duration::from_millis(500),
            open_retry_limit: 120,
            release_wait: Duration::from_secs(1),
        }
    }
}

impl LogOptions {
    /// Negative watch interval means "read what exists and stop".
    pub fn with_watch_interval(mut self, secs: i64) -> Self {
        self.follow = secs >= 0;
        self
    }
}
