//! Namespace Events narrated as progress lines.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::api::Api;
use kube::runtime::watcher::{self, Event as WatchEvent};
use kube::runtime::WatchStreamExt;
use metrics::counter;

/// Whether `name` is `deployment` itself or one of its ReplicaSets or Pods
/// (`<deployment>-<hash>[-<suffix>]`).
fn belongs_to(name: &str, deployment: &str) -> bool {
    match name.strip_prefix(deployment) {
        Some("") => true,
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

/// `reason: message` for events about `deployment` or the objects it owns
/// that are not older than `since`.
pub fn narration_for(event: &Event, deployment: &str, since: DateTime<Utc>) -> Option<String> {
    let involved = event.involved_object.name.as_deref()?;
    if !belongs_to(involved, deployment) {
        return None;
    }
    let at = event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0));
    if matches!(at, Some(at) if at < since) {
        return None;
    }
    let reason = event.reason.as_deref().unwrap_or("Event");
    let message = event.message.as_deref().unwrap_or("").trim();
    Some(format!("{reason}: {message}"))
}

/// Narration lines for `deployment`. Errors are items, never the end of the stream.
pub fn event_lines(api: Api<Event>, deployment: &str, since: DateTime<Utc>) -> BoxStream<'static, anyhow::Result<String>> {
    lines_from(watcher::watcher(api, watcher::Config::default()), deployment, since)
}

/// Narrate a raw Event watch, backing off after each watch error.
fn lines_from<S>(events: S, deployment: &str, since: DateTime<Utc>) -> BoxStream<'static, anyhow::Result<String>>
where
    S: Stream<Item = Result<WatchEvent<Event>, watcher::Error>> + Send + 'static,
{
    let deployment = deployment.to_string();
    events
        .default_backoff()
        .flat_map(move |ev| {
            let lines: Vec<anyhow::Result<String>> = match ev {
                Ok(WatchEvent::Applied(e)) => narration_for(&e, &deployment, since).map(Ok).into_iter().collect(),
                Ok(WatchEvent::Restarted(list)) => {
                    list.iter().filter_map(|e| narration_for(e, &deployment, since)).map(Ok).collect()
                }
                Ok(WatchEvent::Deleted(_)) => Vec::new(),
                Err(e) => {
                    counter!("rollwatch_watch_errors_total", 1u64, "kind" => "event");
                    vec![Err(anyhow::Error::new(e).context("event watch"))]
                }
            };
            futures::stream::iter(lines)
        })
        .boxed()
}
