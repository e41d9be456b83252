//! Rollwatch core types: rollout status vocabulary, log messages, pod
//! bookkeeping types, the capability traits providers implement, and the
//! shared error taxonomy.

#![forbid(unsafe_code)]

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod cancel;
pub mod sink;

pub use cancel::{CancelScope, Done};
pub use sink::{LogEmitter, PrefixTheme, Progress, TracingProgress, WriterEmitter, WriterProgress};

/// Reference meaning "no change happened; treat the rollout as complete".
pub const NOOP_REFERENCE: &str = "noop";

/// Label used to select a workload's pods when no selector override is given.
pub const WORKLOAD_LABEL: &str = "app.kubernetes.io/name";

/// Returns true when `reference` means there is nothing to wait for.
pub fn is_trivial_reference(reference: &str) -> bool {
    reference.is_empty() || reference == NOOP_REFERENCE
}

/// Outcome vocabulary shared by every deploy watcher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
    Unknown,
}

impl RolloutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log line attributed to one `pod/container` stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogMessage {
    pub source_type: String,
    pub source: String,
    /// `pod/container`
    pub stream: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogMessage {
    pub fn new(
        source_type: impl Into<String>,
        source: impl Into<String>,
        stream: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            source: source.into(),
            stream: stream.into(),
            timestamp,
            message: message.into(),
        }
    }
}

/// Stream identity for a container: `pod/container`.
pub fn stream_id(pod: &str, container: &str) -> String {
    format!("{}/{}", pod, container)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Observed pod shape; the platform owns the pod, we only track names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
    pub init_containers: Vec<String>,
    pub containers: Vec<String>,
}

impl PodInfo {
    /// Init containers first (they run to completion before the others start).
    pub fn all_containers(&self) -> impl Iterator<Item = &str> {
        self.init_containers.iter().chain(self.containers.iter()).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodEvent {
    Added(PodInfo),
    Modified(PodInfo),
    Deleted(PodInfo),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodList {
    pub pods: Vec<PodInfo>,
    /// Version to seed the follow-up watch with, so nothing falls between list and watch.
    pub resource_version: String,
}

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;
pub type PodEventStream = BoxStream<'static, anyhow::Result<PodEvent>>;

/// Answers "what is the current status of rollout `reference`" for one platform.
#[async_trait::async_trait]
pub trait DeployStatusGetter: Send + Sync {
    async fn get_deploy_status(&self, scope: &CancelScope, reference: &str) -> anyhow::Result<RolloutStatus>;
}

/// Opens the raw log byte stream of one container.
#[async_trait::async_trait]
pub trait StreamGetter: Send + Sync {
    async fn get_stream(
        &self,
        pod: &str,
        container: &str,
        since: DateTime<Utc>,
        follow: bool,
    ) -> Result<ByteStream, StreamError>;
}

/// Label-selector based pod list + watch.
#[async_trait::async_trait]
pub trait PodDiscovery: Send + Sync {
    /// Short platform name used in messages and errors.
    fn source_type(&self) -> &str;

    async fn list_pods(&self, selector: &str) -> anyhow::Result<PodList>;

    async fn watch_pods(&self, selector: &str, resource_version: &str) -> anyhow::Result<PodEventStream>;
}

// ---- errors ----

/// Failure to build a client or open a watch/stream, before any data flowed.
#[derive(Debug, thiserror::Error)]
#[error("{source_type} {source_id}: {cause:#}")]
pub struct InitError {
    pub source_type: String,
    pub source_id: String,
    #[source]
    pub cause: anyhow::Error,
}

impl InitError {
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>, cause: anyhow::Error) -> Self {
        Self { source_type: source_type.into(), source_id: source_id.into(), cause }
    }
}

/// Final result of a deploy watch that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("deploy failed: {0}")]
    Failed(String),
    #[error("timed out waiting for deploy")]
    Timeout,
    #[error("deploy watch cancelled: {reason}")]
    Cancelled { reason: String },
    #[error(transparent)]
    Init(#[from] InitError),
}

impl WatchError {
    /// Map how a scope ended into the matching watch error.
    pub fn from_done(done: Done) -> Self {
        match done {
            Done::DeadlineExceeded => Self::Timeout,
            Done::Cancelled(reason) => Self::Cancelled { reason },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Container exists but is not producing logs yet (creating, initializing).
    #[error("container {pod}/{container} is not ready: {reason}")]
    NotReady { pod: String, container: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}

pub mod prelude {
    pub use super::{
        CancelScope, DeployStatusGetter, Done, InitError, LogEmitter, LogMessage, PodDiscovery, PodEvent,
        PodInfo, PodList, PodPhase, Progress, RolloutStatus, StreamError, StreamGetter, WatchError,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = [
            RolloutStatus::Pending,
            RolloutStatus::InProgress,
            RolloutStatus::Complete,
            RolloutStatus::Failed,
            RolloutStatus::Cancelled,
            RolloutStatus::Unknown,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(terminal, vec![RolloutStatus::Complete, RolloutStatus::Failed, RolloutStatus::Cancelled]);
    }

    #[test]
    fn trivial_references() {
        assert!(is_trivial_reference(""));
        assert!(is_trivial_reference(NOOP_REFERENCE));
        assert!(!is_trivial_reference("3"));
    }

    #[test]
    fn init_containers_come_first() {
        let pod = PodInfo {
            name: "web-1".into(),
            phase: PodPhase::Pending,
            init_containers: vec!["migrate".into()],
            containers: vec!["app".into(), "sidecar".into()],
        };
        let names: Vec<_> = pod.all_containers().collect();
        assert_eq!(names, vec!["migrate", "app", "sidecar"]);
    }

    #[test]
    fn init_error_renders_source_and_cause() {
        let e = InitError::new("kubernetes", "app=web", anyhow::anyhow!("connection refused"));
        assert_eq!(e.to_string(), "kubernetes app=web: connection refused");
        let w: WatchError = e.into();
        assert!(matches!(w, WatchError::Init(_)));
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&RolloutStatus::InProgress).expect("serialize");
        assert_eq!(s, "\"in_progress\"");
    }
}
