use std::sync::Arc;

use rollwatch_core::{PodInfo, StreamGetter};
use rollwatch_store::OrderedLogBuffer;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::container::ContainerStreamer;
use crate::LogOptions;

/// Streams every container of one pod, init containers first.
pub struct PodStreamer {
    pod: PodInfo,
    containers: Vec<ContainerStreamer>,
    stop: CancellationToken,
}

impl PodStreamer {
    pub fn new(pod: PodInfo, source_type: &str, getter: Arc<dyn StreamGetter>, stop: CancellationToken) -> Self {
        let containers = pod
            .all_containers()
            .map(|c| ContainerStreamer::new(&pod.name, c, source_type, getter.clone(), stop.child_token()))
            .collect();
        Self { pod, containers, stop }
    }

    pub fn name(&self) -> &str {
        &self.pod.name
    }

    pub fn containers(&self) -> &[ContainerStreamer] {
        &self.containers
    }

    /// Stops every container; each still runs its stop flush.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Returns once every container stream has ended.
    pub async fn stream(&self, opts: LogOptions, buffer: OrderedLogBuffer) {
        let mut set = JoinSet::new();
        for container in &self.containers {
            let container = container.clone();
            let opts = opts.clone();
            let buffer = buffer.clone();
            set.spawn(async move { container.stream(&opts, &buffer).await });
        }
        debug!(pod = %self.pod.name, containers = self.containers.len(), "pod log streams started");
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(pod = %self.pod.name, error = %e, "container log task aborted");
            }
        }
        debug!(pod = %self.pod.name, "pod log streams finished");
    }
}
