use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rollwatch_core::{
    CancelScope, InitError, PodDiscovery, PodEvent, PodEventStream, PodInfo, StreamGetter, WORKLOAD_LABEL,
};
use rollwatch_store::OrderedLogBuffer;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::pod::PodStreamer;
use crate::LogOptions;

#[derive(Default)]
struct Tracking {
    /// Live pod streamers and the token their task cancels when it ends.
    live: HashMap<String, (Arc<PodStreamer>, CancellationToken)>,
    /// Removed pods whose streams may still be flushing.
    stopping: HashMap<String, CancellationToken>,
}

/// Follows the pods of one workload, starting and stopping pod streamers as
/// they appear and go away.
pub struct WorkloadStreamer {
    workload: String,
    discovery: Arc<dyn PodDiscovery>,
    getter: Arc<dyn StreamGetter>,
    buffer: OrderedLogBuffer,
    opts: LogOptions,
    // Not tied to the session scope: pods keep streaming through the cancel flush.
    root: CancellationToken,
    pods: Mutex<Tracking>,
    tasks: TaskTracker,
}

impl WorkloadStreamer {
    pub fn new(
        workload: &str,
        discovery: Arc<dyn PodDiscovery>,
        getter: Arc<dyn StreamGetter>,
        buffer: OrderedLogBuffer,
        opts: LogOptions,
    ) -> Self {
        Self {
            workload: workload.to_string(),
            discovery,
            getter,
            buffer,
            opts,
            root: CancellationToken::new(),
            pods: Mutex::new(Tracking::default()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    pub fn selector(&self) -> String {
        match &self.opts.selector {
            Some(s) if !s.is_empty() => s.clone(),
            _ => format!("{}={}", WORKLOAD_LABEL, self.workload),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracking> {
        match self.pods.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start streaming `pod` unless it is already tracked. Returns whether it was added.
    ///
    /// A pod that comes back under the name of one still flushing starts
    /// reading once the old streams have released their slots, from the time
    /// it was added.
    pub fn add_pod(&self, pod: PodInfo) -> bool {
        let mut pods = self.lock();
        if pods.live.contains_key(&pod.name) {
            return false;
        }
        pods.stopping.retain(|_, finished| !finished.is_cancelled());
        let previous = pods.stopping.remove(&pod.name);
        let name = pod.name.clone();
        let streamer = Arc::new(PodStreamer::new(
            pod,
            self.discovery.source_type(),
            self.getter.clone(),
            self.root.child_token(),
        ));
        let finished = CancellationToken::new();
        pods.live.insert(name.clone(), (streamer.clone(), finished.clone()));
        drop(pods);

        let mut opts = self.opts.clone();
        if previous.is_some() {
            opts.since.get_or_insert_with(Utc::now);
            debug!(workload = %self.workload, pod = %name, "pod re-added while its previous streams flush");
        }
        let buffer = self.buffer.clone();
        self.tasks.spawn(async move {
            let _finished = finished.drop_guard();
            if let Some(previous) = previous {
                previous.cancelled().await;
                if streamer.is_stopped() {
                    return;
                }
            }
            streamer.stream(opts, buffer).await
        });
        info!(workload = %self.workload, pod = %name, "streaming pod logs");
        true
    }

    /// Stop streaming `name` and forget it. Returns whether it was tracked.
    pub fn remove_pod(&self, name: &str) -> bool {
        let mut pods = self.lock();
        let Some((streamer, finished)) = pods.live.remove(name) else {
            return false;
        };
        pods.stopping.insert(name.to_string(), finished);
        drop(pods);
        streamer.stop();
        info!(workload = %self.workload, pod = %name, "stopped streaming pod logs");
        true
    }

    pub fn tracked_pods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stream until the pod watch closes or `scope` is done.
    pub async fn stream(&self, scope: &CancelScope) -> Result<(), InitError> {
        let selector = self.selector();
        let source_type = self.discovery.source_type().to_string();
        let list = match self.discovery.list_pods(&selector).await {
            Ok(list) => list,
            Err(e) => return Err(InitError::new(source_type, &self.workload, e.context("listing pods"))),
        };
        debug!(workload = %self.workload, selector = %selector, pods = list.pods.len(), "initial pod list");
        for pod in list.pods {
            if !pod.phase.is_terminal() {
                self.add_pod(pod);
            }
        }

        if !self.opts.follow {
            self.tasks.close();
            tokio::select! {
                _ = self.tasks.wait() => {}
                _ = scope.done() => self.cancel_flush().await,
            }
            self.shutdown().await;
            return Ok(());
        }

        let mut events = match self.discovery.watch_pods(&selector, &list.resource_version).await {
            Ok(events) => events,
            Err(e) => {
                self.shutdown().await;
                return Err(InitError::new(source_type, &self.workload, e.context("watching pods")));
            }
        };

        loop {
            tokio::select! {
                biased;
                done = scope.done() => {
                    debug!(workload = %self.workload, ?done, "log session done");
                    self.cancel_flush_following(&mut events).await;
                    break;
                }
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle(event, true),
                    Some(Err(e)) => {
                        warn!(workload = %self.workload, error = %e, "pod watch failed; ending log stream");
                        break;
                    }
                    None => {
                        debug!(workload = %self.workload, "pod watch closed");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Apply one pod event; new pods are only started while `admit` holds.
    fn handle(&self, event: PodEvent, admit: bool) {
        match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => {
                if pod.phase.is_terminal() {
                    self.remove_pod(&pod.name);
                } else if admit {
                    self.add_pod(pod);
                }
            }
            PodEvent::Deleted(pod) => {
                self.remove_pod(&pod.name);
            }
        }
    }

    async fn cancel_flush(&self) {
        let wait = self.opts.cancel_flush_timeout;
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
    }

    /// Sleep out the cancel flush, still stopping pods that go away meanwhile.
    async fn cancel_flush_following(&self, events: &mut PodEventStream) {
        let window = tokio::time::sleep(self.opts.cancel_flush_timeout);
        tokio::pin!(window);
        let mut watching = true;
        loop {
            tokio::select! {
                biased;
                _ = &mut window => return,
                next = events.next(), if watching => match next {
                    Some(Ok(event)) => self.handle(event, false),
                    _ => watching = false,
                },
            }
        }
    }

    /// Stop every pod and wait for all of them to finish.
    async fn shutdown(&self) {
        self.root.cancel();
        {
            let mut pods = self.lock();
            pods.live.clear();
            pods.stopping.clear();
        }
        self.tasks.close();
        self.tasks.wait().await;
        info!(workload = %self.workload, "log streaming stopped");
    }
}

impl Drop for WorkloadStreamer {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
