//! Pod log streams and label-selector pod discovery.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams, WatchEvent, WatchParams};
use kube::ResourceExt;
use metrics::counter;
use rollwatch_core::{ByteStream, PodDiscovery, PodEvent, PodEventStream, PodInfo, PodList, PodPhase, StreamError, StreamGetter};
use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
use tracing::{debug, info, warn};

use crate::SOURCE_TYPE;

/// The API answers 400 with one of these while a container has not started yet.
const NOT_READY_MARKERS: &[&str] = &["is waiting to start", "ContainerCreating", "PodInitializing"];

/// `Some(reason)` when an API error only means "try again shortly".
pub fn not_ready_reason(code: u16, message: &str) -> Option<String> {
    if code != 400 {
        return None;
    }
    NOT_READY_MARKERS
        .iter()
        .any(|m| message.contains(m))
        .then(|| message.to_string())
}

pub fn pod_info_from(pod: &Pod) -> PodInfo {
    let phase = match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };
    let (init_containers, containers) = match &pod.spec {
        Some(spec) => (
            spec.init_containers
                .as_ref()
                .map(|cs| cs.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            spec.containers.iter().map(|c| c.name.clone()).collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    PodInfo { name: pod.name_any(), phase, init_containers, containers }
}

/// Opens `kubectl logs`-style streams with timestamps on every line.
#[derive(Clone)]
pub struct KubeStreamGetter {
    api: Api<Pod>,
}

impl KubeStreamGetter {
    pub fn new(api: Api<Pod>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl StreamGetter for KubeStreamGetter {
    async fn get_stream(
        &self,
        pod: &str,
        container: &str,
        since: DateTime<Utc>,
        follow: bool,
    ) -> Result<ByteStream, StreamError> {
        let lp = LogParams {
            container: Some(container.to_string()),
            follow,
            since_time: Some(since),
            timestamps: true,
            ..LogParams::default()
        };
        debug!(pod = %pod, container = %container, follow, since = %since, "opening pod log stream");
        let reader = match self.api.log_stream(pod, &lp).await {
            Ok(r) => r,
            Err(kube::Error::Api(resp)) => {
                if let Some(reason) = not_ready_reason(resp.code, &resp.message) {
                    return Err(StreamError::NotReady {
                        pod: pod.to_string(),
                        container: container.to_string(),
                        reason,
                    });
                }
                return Err(StreamError::Other(anyhow!("opening log stream: {} ({})", resp.message, resp.code)));
            }
            Err(e) => return Err(StreamError::Other(anyhow::Error::new(e).context("opening log stream"))),
        };
        // futures::io::AsyncRead -> tokio::io::AsyncRead -> Stream<Bytes>
        Ok(ReaderStream::new(reader.compat()).boxed())
    }
}

/// List + watch pods by label selector.
#[derive(Clone)]
pub struct KubePodDiscovery {
    api: Api<Pod>,
}

impl KubePodDiscovery {
    pub fn new(api: Api<Pod>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl PodDiscovery for KubePodDiscovery {
    fn source_type(&self) -> &str {
        SOURCE_TYPE
    }

    async fn list_pods(&self, selector: &str) -> anyhow::Result<PodList> {
        let list = self
            .api
            .list(&ListParams::default().labels(selector))
            .await
            .with_context(|| format!("listing pods with {selector}"))?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let pods: Vec<PodInfo> = list.items.iter().map(pod_info_from).collect();
        info!(selector = %selector, count = pods.len(), rv = %resource_version, "pods listed");
        Ok(PodList { pods, resource_version })
    }

    async fn watch_pods(&self, selector: &str, resource_version: &str) -> anyhow::Result<PodEventStream> {
        let wp = WatchParams::default().labels(selector);
        let events = self
            .api
            .watch(&wp, resource_version)
            .await
            .with_context(|| format!("watching pods with {selector}"))?;
        let stream = events.filter_map(|ev| async move {
            match ev {
                Ok(WatchEvent::Added(p)) => Some(Ok(PodEvent::Added(pod_info_from(&p)))),
                Ok(WatchEvent::Modified(p)) => Some(Ok(PodEvent::Modified(pod_info_from(&p)))),
                Ok(WatchEvent::Deleted(p)) => Some(Ok(PodEvent::Deleted(pod_info_from(&p)))),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(e)) => {
                    counter!("rollwatch_watch_errors_total", 1u64, "kind" => "pod");
                    warn!(code = e.code, message = %e.message, "pod watch error event");
                    Some(Err(anyhow!("pod watch: {} ({})", e.message, e.code)))
                }
                Err(e) => Some(Err(anyhow::Error::new(e).context("pod watch"))),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_json(phase: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web-7d9f-abcde", "namespace": "default" },
            "spec": {
                "initContainers": [{ "name": "migrate", "image": "busybox" }],
                "containers": [{ "name": "app", "image": "nginx" }, { "name": "sidecar", "image": "envoy" }]
            },
            "status": { "phase": phase }
        }))
        .unwrap()
    }

    #[test]
    fn pod_info_keeps_container_order_and_phase() {
        let info = pod_info_from(&pod_json("Running"));
        assert_eq!(info.name, "web-7d9f-abcde");
        assert_eq!(info.phase, PodPhase::Running);
        assert_eq!(info.all_containers().collect::<Vec<_>>(), vec!["migrate", "app", "sidecar"]);
        assert!(pod_info_from(&pod_json("Succeeded")).phase.is_terminal());
        assert_eq!(pod_info_from(&pod_json("Whatever")).phase, PodPhase::Unknown);
    }

    #[test]
    fn pod_without_spec_has_no_containers() {
        let pod: Pod = serde_json::from_value(serde_json::json!({ "metadata": { "name": "bare" } })).unwrap();
        let info = pod_info_from(&pod);
        assert_eq!(info.phase, PodPhase::Unknown);
        assert!(info.all_containers().next().is_none());
    }

    #[test]
    fn not_ready_errors_are_recognised() {
        let msg = r#"container "app" in pod "web-1" is waiting to start: ContainerCreating"#;
        assert_eq!(not_ready_reason(400, msg).as_deref(), Some(msg));
        assert!(not_ready_reason(400, "PodInitializing").is_some());
        assert!(not_ready_reason(404, msg).is_none());
        assert!(not_ready_reason(400, "container not found").is_none());
    }
}
