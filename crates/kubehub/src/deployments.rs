use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use metrics::counter;
use tracing::debug;

/// What happened to the watched Deployment.
#[derive(Debug, Clone)]
pub enum DeploymentUpdate {
    Applied(Box<Deployment>),
    Deleted,
}

/// Updates of a single Deployment, starting with its current state.
///
/// Watcher errors surface as `Err` items; the stream backs off after each
/// one and then retries, so callers may keep polling after one.
pub fn deployment_updates(api: Api<Deployment>, name: &str) -> BoxStream<'static, anyhow::Result<DeploymentUpdate>> {
    let cfg = watcher::Config::default().fields(&format!("metadata.name={name}"));
    updates_from(watcher::watcher(api, cfg), name)
}

fn updates_from<S>(events: S, name: &str) -> BoxStream<'static, anyhow::Result<DeploymentUpdate>>
where
    S: Stream<Item = Result<Event<Deployment>, watcher::Error>> + Send + 'static,
{
    let wanted = name.to_string();
    events
        .default_backoff()
        .filter_map(move |ev| {
            let wanted = wanted.clone();
            async move {
                match ev {
                    Ok(Event::Applied(d)) => Some(Ok(DeploymentUpdate::Applied(Box::new(d)))),
                    Ok(Event::Deleted(_)) => Some(Ok(DeploymentUpdate::Deleted)),
                    Ok(Event::Restarted(list)) => {
                        debug!(deployment = %wanted, count = list.len(), "deployment watch (re)started");
                        // Empty relist: the Deployment does not exist yet; wait for it.
                        list.into_iter()
                            .find(|d| d.name_any() == wanted)
                            .map(|d| Ok(DeploymentUpdate::Applied(Box::new(d))))
                    }
                    Err(e) => {
                        counter!("rollwatch_watch_errors_total", 1u64, "kind" => "deployment");
                        Some(Err(anyhow::Error::new(e).context("deployment watch")))
                    }
                }
            }
        })
        .boxed()
}
