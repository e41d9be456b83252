//! Deployment rollout watch: subscribe to one Deployment and map each
//! observed revision/replica state to a `RolloutStatus`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::ResourceExt;
use rollwatch_core::{
    is_trivial_reference, CancelScope, DeployStatusGetter, InitError, Progress, RolloutStatus, TracingProgress,
    WatchError,
};
use rollwatch_kubehub::{deployment_updates, event_lines, ClientConfig, DeploymentUpdate, KubeContext, SOURCE_TYPE};
use tracing::{debug, info, warn};

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// A status plus the human explanation for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: RolloutStatus,
    pub detail: String,
}

impl StatusReport {
    fn new(status: RolloutStatus, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

/// Revision from the controller's annotation; 0 when absent or unparsable.
pub fn revision_of(d: &Deployment) -> i64 {
    d.annotations()
        .get(REVISION_ANNOTATION)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Compare the Deployment's revision with the one being waited for.
pub fn verify_revision(d: &Deployment, expected: i64) -> StatusReport {
    let latest = revision_of(d);
    let name = d.name_any();
    if latest < expected {
        StatusReport::new(RolloutStatus::Pending, format!("deployment {name}: waiting for revision {expected} (at {latest})"))
    } else if latest > expected {
        StatusReport::new(
            RolloutStatus::Failed,
            format!("deployment {name}: revision {expected} was superseded by revision {latest}"),
        )
    } else {
        deployment_status(d)
    }
}

/// Replica-convergence status of a Deployment at its current revision.
pub fn deployment_status(d: &Deployment) -> StatusReport {
    let name = d.name_any();
    let Some(status) = d.status.as_ref() else {
        return StatusReport::new(RolloutStatus::InProgress, format!("deployment {name}: waiting for status"));
    };
    let generation = d.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return StatusReport::new(RolloutStatus::InProgress, format!("deployment {name}: waiting for spec update to be observed"));
    }
    let deadline_exceeded = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"));
    if deadline_exceeded {
        return StatusReport::new(RolloutStatus::Failed, format!("deployment {name} exceeded its progress deadline"));
    }

    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let total = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if updated < desired {
        StatusReport::new(RolloutStatus::InProgress, format!("deployment {name}: {updated} of {desired} new replicas have been updated"))
    } else if total > updated {
        StatusReport::new(
            RolloutStatus::InProgress,
            format!("deployment {name}: {} old replicas are pending termination", total - updated),
        )
    } else if available < updated {
        StatusReport::new(RolloutStatus::InProgress, format!("deployment {name}: {available} of {updated} updated replicas are available"))
    } else {
        StatusReport::new(RolloutStatus::Complete, format!("deployment {name} successfully rolled out"))
    }
}

/// Consume Deployment updates until a terminal status or the scope ends.
pub async fn drive<S>(
    scope: &CancelScope,
    mut updates: S,
    expected: i64,
    progress: &dyn Progress,
    name: &str,
) -> Result<(), WatchError>
where
    S: Stream<Item = anyhow::Result<DeploymentUpdate>> + Unpin,
{
    let mut last: Option<String> = None;
    loop {
        let next = tokio::select! {
            biased;
            done = scope.done() => return Err(WatchError::from_done(done)),
            next = updates.next() => next,
        };
        let d = match next {
            None => return Err(WatchError::Failed(format!("deployment {name}: watch closed before the rollout finished"))),
            Some(Err(e)) => {
                warn!(deployment = %name, error = %format!("{e:#}"), "deployment watch error; waiting for the next update");
                continue;
            }
            Some(Ok(DeploymentUpdate::Deleted)) => {
                return Err(WatchError::Failed(format!("deployment {name} was deleted during the rollout")))
            }
            Some(Ok(DeploymentUpdate::Applied(d))) => d,
        };
        let report = verify_revision(&d, expected);
        debug!(deployment = %name, status = %report.status, detail = %report.detail, "deployment update");
        match report.status {
            RolloutStatus::Complete => {
                progress.step(&report.detail);
                return Ok(());
            }
            RolloutStatus::Failed => return Err(WatchError::Failed(report.detail)),
            RolloutStatus::Cancelled => {
                return Err(WatchError::Cancelled { reason: "rollout cancelled by platform".to_string() })
            }
            _ => {
                if last.as_deref() != Some(report.detail.as_str()) {
                    progress.step(&report.detail);
                    last = Some(report.detail);
                }
            }
        }
    }
}

async fn narrate(mut lines: BoxStream<'static, anyhow::Result<String>>, progress: Arc<dyn Progress>) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => progress.step(&line),
            Err(e) => warn!(error = %format!("{e:#}"), "event narration error"),
        }
    }
}

/// Watches one Deployment until it reaches the expected revision's terminal state.
pub struct KubernetesDeployWatcher {
    config: ClientConfig,
    context: Option<KubeContext>,
    deployment: String,
    timeout: Duration,
    progress: Arc<dyn Progress>,
}

impl KubernetesDeployWatcher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    pub fn new(config: ClientConfig, deployment: &str) -> Self {
        Self {
            config,
            context: None,
            deployment: deployment.to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
            progress: Arc::new(TracingProgress),
        }
    }

    /// Use an already connected client instead of resolving one from the config.
    pub fn with_context(mut self, context: KubeContext) -> Self {
        self.context = Some(context);
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
            debug!(deployment = %self.deployment, reference = %reference, "nothing to wait for");
            return Ok(());
        }
        let expected: i64 = reference.trim().parse().map_err(|e| {
            InitError::new(SOURCE_TYPE, &self.deployment, anyhow!("invalid revision reference {reference:?}: {e}"))
        })?;
        let kube = match &self.context {
            Some(k) => k.clone(),
            None => self.config.connect().await?,
        };
        let scope = scope.with_timeout(self.timeout);
        info!(deployment = %self.deployment, ns = %kube.namespace(), revision = expected, timeout_s = self.timeout.as_secs(), "watching rollout");

        let narrator = tokio::spawn(narrate(
            event_lines(kube.events(), &self.deployment, chrono::Utc::now()),
            self.progress.clone(),
        ));
        let updates = deployment_updates(kube.deployments(), &self.deployment);
        let res = drive(&scope, updates, expected, self.progress.as_ref(), &self.deployment).await;
        narrator.abort();
        match &res {
            Ok(()) => info!(deployment = %self.deployment, revision = expected, "rollout complete"),
            Err(e) => info!(deployment = %self.deployment, revision = expected, error = %e, "rollout did not complete"),
        }
        res
    }
}

/// Probes a Deployment with a plain GET; feeds `PollingDeployWatcher`.
pub struct DeploymentStatusGetter {
    api: Api<Deployment>,
    name: String,
}

impl DeploymentStatusGetter {
    pub fn new(api: Api<Deployment>, name: &str) -> Self {
        Self { api, name: name.to_string() }
    }
}

#[async_trait::async_trait]
impl DeployStatusGetter for DeploymentStatusGetter {
    async fn get_deploy_status(&self, _scope: &CancelScope, reference: &str) -> anyhow::Result<RolloutStatus> {
        let expected: i64 = reference.trim().parse().with_context(|| format!("invalid revision reference {reference:?}"))?;
        let d = self.api.get(&self.name).await.with_context(|| format!("getting deployment {}", self.name))?;
        let report = verify_revision(&d, expected);
        debug!(deployment = %self.name, status = %report.status, detail = %report.detail, "deployment probed");
        Ok(report.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn deployment(revision: Option<&str>, spec_replicas: i32, status: serde_json::Value) -> Deployment {
        let mut meta = serde_json::json!({ "name": "web", "namespace": "default", "generation": 4 });
        if let Some(r) = revision {
            meta["annotations"] = serde_json::json!({ "deployment.kubernetes.io/revision": r });
        }
        serde_json::from_value(serde_json::json!({
            "metadata": meta,
            "spec": {
                "replicas": spec_replicas,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "metadata": { "labels": { "app": "web" } }, "spec": { "containers": [{ "name": "app", "image": "nginx" }] } }
            },
            "status": status,
        }))
        .unwrap()
    }

    fn converged(revision: &str) -> Deployment {
        deployment(
            Some(revision),
            3,
            serde_json::json!({ "observedGeneration": 4, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3 }),
        )
    }

    #[derive(Default)]
    struct Steps(Mutex<Vec<String>>);

    impl Progress for Steps {
        fn step(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[test]
    fn revision_tie_break() {
        assert_eq!(verify_revision(&converged("2"), 3).status, RolloutStatus::Pending);
        let newer = verify_revision(&converged("4"), 3);
        assert_eq!(newer.status, RolloutStatus::Failed);
        assert!(newer.detail.contains("superseded by revision 4"));
        assert_eq!(verify_revision(&converged("3"), 3).status, RolloutStatus::Complete);
    }

    #[test]
    fn missing_revision_counts_as_zero() {
        let d = deployment(None, 1, serde_json::json!({}));
        assert_eq!(revision_of(&d), 0);
        assert_eq!(verify_revision(&d, 1).status, RolloutStatus::Pending);
    }

    #[test]
    fn replica_convergence_is_required_for_complete() {
        let cases = [
            (serde_json::json!({ "observedGeneration": 3, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3 }), "observed"),
            (serde_json::json!({ "observedGeneration": 4, "replicas": 3, "updatedReplicas": 1, "availableReplicas": 1 }), "1 of 3 new replicas"),
            (serde_json::json!({ "observedGeneration": 4, "replicas": 4, "updatedReplicas": 3, "availableReplicas": 3 }), "1 old replicas"),
            (serde_json::json!({ "observedGeneration": 4, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 2 }), "2 of 3 updated"),
        ];
        for (status, needle) in cases {
            let report = deployment_status(&deployment(Some("1"), 3, status));
            assert_eq!(report.status, RolloutStatus::InProgress, "{needle}");
            assert!(report.detail.contains(needle), "{}", report.detail);
        }
    }

    #[test]
    fn progress_deadline_is_a_failure() {
        let d = deployment(
            Some("1"),
            3,
            serde_json::json!({
                "observedGeneration": 4, "replicas": 3, "updatedReplicas": 1,
                "conditions": [{ "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded" }]
            }),
        );
        let report = deployment_status(&d);
        assert_eq!(report.status, RolloutStatus::Failed);
        assert!(report.detail.contains("progress deadline"));
    }

    fn applied(d: Deployment) -> anyhow::Result<DeploymentUpdate> {
        Ok(DeploymentUpdate::Applied(Box::new(d)))
    }

    #[tokio::test]
    async fn drive_waits_through_pending_and_progress() {
        let updates = futures::stream::iter(vec![
            applied(converged("2")),
            Err(anyhow!("connection reset")),
            applied(deployment(Some("3"), 3, serde_json::json!({ "observedGeneration": 4, "replicas": 3, "updatedReplicas": 1 }))),
            applied(deployment(Some("3"), 3, serde_json::json!({ "observedGeneration": 4, "replicas": 3, "updatedReplicas": 1 }))),
            applied(converged("3")),
        ]);
        let steps = Steps::default();
        drive(&CancelScope::new(), updates, 3, &steps, "web").await.unwrap();
        let steps = steps.0.lock().unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].contains("waiting for revision 3"));
        assert!(steps[2].contains("successfully rolled out"));
    }

    #[tokio::test]
    async fn drive_fails_on_superseded_deleted_or_closed() {
        let steps = Steps::default();
        let superseded = futures::stream::iter(vec![applied(converged("5"))]);
        assert!(matches!(drive(&CancelScope::new(), superseded, 3, &steps, "web").await, Err(WatchError::Failed(_))));

        let deleted = futures::stream::iter(vec![Ok(DeploymentUpdate::Deleted)]);
        assert!(matches!(drive(&CancelScope::new(), deleted, 3, &steps, "web").await, Err(WatchError::Failed(_))));

        let closed = futures::stream::iter(Vec::<anyhow::Result<DeploymentUpdate>>::new());
        match drive(&CancelScope::new(), closed, 3, &steps, "web").await {
            Err(WatchError::Failed(msg)) => assert!(msg.contains("watch closed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drive_distinguishes_deadline_from_cancel() {
        let steps = Steps::default();
        let scope = CancelScope::new().with_timeout(Duration::from_secs(10));
        let silent = futures::stream::pending::<anyhow::Result<DeploymentUpdate>>();
        assert!(matches!(drive(&scope, silent, 3, &steps, "web").await, Err(WatchError::Timeout)));

        let scope = CancelScope::new();
        scope.cancel("operator aborted");
        let silent = futures::stream::pending::<anyhow::Result<DeploymentUpdate>>();
        match drive(&scope, silent, 3, &steps, "web").await {
            Err(WatchError::Cancelled { reason }) => assert_eq!(reason, "operator aborted"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn sentinels_and_bad_references_never_connect() {
        let w = KubernetesDeployWatcher::new(ClientConfig::default(), "web");
        w.watch(&CancelScope::new(), "").await.unwrap();
        w.watch(&CancelScope::new(), rollwatch_core::NOOP_REFERENCE).await.unwrap();
        match w.watch(&CancelScope::new(), "v3").await {
            Err(WatchError::Init(e)) => {
                assert_eq!(e.source_type, SOURCE_TYPE);
                assert_eq!(e.source_id, "web");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
