use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rollwatch_core::{
    is_trivial_reference, CancelScope, LogEmitter, PrefixTheme, Progress, TracingProgress, WatchError, WriterEmitter,
    WriterProgress,
};
use rollwatch_kubehub::ClientConfig;
use rollwatch_logs::{LogOptions, WorkloadStreamer};
use rollwatch_rollout::{DeploymentStatusGetter, KubernetesDeployWatcher, PollingDeployWatcher};
use rollwatch_store::{spawn_emitter, BufferConfig, OrderedLogBuffer};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rollwatchctl", version, about = "Wait for rollouts and stream workload logs")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true, env = "ROLLWATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Kubeconfig context (default: current context or in-cluster)
    #[arg(long = "context", global = true, env = "ROLLWATCH_CONTEXT")]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Theme {
    Bright,
    Basic,
    Gray,
    None,
}

impl From<Theme> for PrefixTheme {
    fn from(t: Theme) -> Self {
        match t {
            Theme::Bright => PrefixTheme::Bright,
            Theme::Basic => PrefixTheme::Basic,
            Theme::Gray => PrefixTheme::Gray,
            Theme::None => PrefixTheme::None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a workload's pod logs, merged in time order
    Logs {
        /// Workload name, matched against the app.kubernetes.io/name label
        workload: String,
        /// Label selector overriding the workload label
        #[arg(long = "selector", short = 'l')]
        selector: Option<String>,
        /// Start this many seconds in the past (default: now)
        #[arg(long = "since-seconds")]
        since_seconds: Option<u64>,
        /// Negative: print what exists and exit instead of following
        #[arg(long = "watch-interval", default_value_t = 0, allow_negative_numbers = true)]
        watch_interval: i64,
        /// Extra time containers get to flush after Ctrl-C
        #[arg(long = "cancel-flush-ms", default_value_t = 0)]
        cancel_flush_ms: u64,
        /// Bound on re-reading trailing lines of a stopped container (0 disables)
        #[arg(long = "stop-flush-ms", default_value_t = 0)]
        stop_flush_ms: u64,
        /// Ordering grace window
        #[arg(long = "grace-ms", env = "ROLLWATCH_GRACE_MS")]
        grace_ms: Option<u64>,
        /// Prefix colours
        #[arg(long = "theme", value_enum, default_value_t = Theme::Bright)]
        theme: Theme,
    },
    /// Wait for a Deployment to finish rolling out a revision
    Rollout {
        /// Deployment name
        deployment: String,
        /// Expected revision ("noop" or "" to skip)
        revision: String,
        /// Give up after this long (default: 10m watching, 15m polling)
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        /// Poll the Deployment instead of watching it
        #[arg(long = "poll", action = ArgAction::SetTrue)]
        poll: bool,
        /// Delay between polls
        #[arg(long = "poll-delay-ms", env = "ROLLWATCH_POLL_DELAY_MS", default_value_t = 5000)]
        poll_delay_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("ROLLWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ROLLWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ROLLWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `scope` on the first Ctrl-C.
fn cancel_on_interrupt(scope: &CancelScope) {
    let scope = scope.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
            scope.cancel("interrupted by user");
        }
    });
}

#[derive(Serialize)]
struct RolloutSummary<'a> {
    deployment: &'a str,
    revision: &'a str,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn outcome_of(res: &Result<(), WatchError>) -> &'static str {
    match res {
        Ok(()) => "complete",
        Err(WatchError::Failed(_)) => "failed",
        Err(WatchError::Timeout) => "timeout",
        Err(WatchError::Cancelled { .. }) => "cancelled",
        Err(WatchError::Init(_)) => "init_error",
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_logs(
    cli_out: Output,
    client: ClientConfig,
    scope: &CancelScope,
    workload: String,
    selector: Option<String>,
    since_seconds: Option<u64>,
    watch_interval: i64,
    cancel_flush_ms: u64,
    stop_flush_ms: u64,
    grace_ms: Option<u64>,
    theme: Theme,
) -> Result<()> {
    let kube = client.connect().await?;
    let mut cfg = BufferConfig::from_env();
    if let Some(ms) = grace_ms {
        cfg.grace = Duration::from_millis(ms);
    }
    let (buffer, rx) = OrderedLogBuffer::new(cfg);
    let emitter: Arc<dyn LogEmitter> = match cli_out {
        Output::Human => Arc::new(WriterEmitter::new(io::stdout(), theme.into())),
        Output::Json => Arc::new(WriterEmitter::json(io::stdout())),
    };
    let sink = spawn_emitter(rx, emitter);

    let opts = LogOptions {
        since: since_seconds.map(|s| chrono::Utc::now() - chrono::Duration::seconds(s as i64)),
        selector,
        cancel_flush_timeout: Duration::from_millis(cancel_flush_ms),
        stop_flush_timeout: Duration::from_millis(stop_flush_ms),
        ..LogOptions::default()
    }
    .with_watch_interval(watch_interval);
    info!(workload = %workload, ns = %kube.namespace(), follow = opts.follow, "logs invoked");

    let streamer = WorkloadStreamer::new(
        &workload,
        Arc::new(kube.pod_discovery()),
        Arc::new(kube.stream_getter()),
        buffer.clone(),
        opts,
    );
    let res = streamer.stream(scope).await;
    drop(streamer);
    buffer.close();
    match sink.await {
        Ok(emitted) => info!(emitted, "log stream finished"),
        Err(e) => warn!(error = %e, "log emitter task failed"),
    }
    res.map_err(anyhow::Error::from)
}

#[allow(clippy::too_many_arguments)]
async fn run_rollout(
    cli_out: Output,
    client: ClientConfig,
    scope: &CancelScope,
    deployment: &str,
    revision: &str,
    timeout_secs: Option<u64>,
    poll: bool,
    poll_delay_ms: u64,
) -> Result<()> {
    info!(deployment = %deployment, revision = %revision, poll, "rollout invoked");
    let progress: Arc<dyn Progress> = match cli_out {
        Output::Human => Arc::new(WriterProgress::new(io::stdout())),
        Output::Json => Arc::new(TracingProgress),
    };

    let res = if poll {
        if !is_trivial_reference(revision) && revision.trim().parse::<i64>().is_err() {
            bail!("invalid revision {revision:?}: expected a number, \"noop\" or \"\"");
        }
        let kube = client.connect().await?;
        let getter = DeploymentStatusGetter::new(kube.deployments(), deployment);
        let mut watcher = PollingDeployWatcher::new(Arc::new(getter))
            .with_delay(Duration::from_millis(poll_delay_ms))
            .with_progress(progress);
        if let Some(secs) = timeout_secs {
            watcher = watcher.with_timeout(Duration::from_secs(secs));
        }
        watcher.watch(scope, revision).await
    } else {
        let mut watcher = KubernetesDeployWatcher::new(client, deployment).with_progress(progress);
        if let Some(secs) = timeout_secs {
            watcher = watcher.with_timeout(Duration::from_secs(secs));
        }
        watcher.watch(scope, revision).await
    };

    if cli_out == Output::Json {
        let summary = RolloutSummary {
            deployment,
            revision,
            outcome: outcome_of(&res),
            error: res.as_ref().err().map(|e| e.to_string()),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    if let Err(e) = &res {
        error!(deployment = %deployment, error = %e, "rollout did not complete");
    }
    res.map_err(anyhow::Error::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let client = ClientConfig::new(cli.context.clone(), cli.namespace.clone());
    let scope = CancelScope::new();
    cancel_on_interrupt(&scope);

    match cli.command {
        Commands::Logs { workload, selector, since_seconds, watch_interval, cancel_flush_ms, stop_flush_ms, grace_ms, theme } => {
            run_logs(
                cli.output,
                client,
                &scope,
                workload,
                selector,
                since_seconds,
                watch_interval,
                cancel_flush_ms,
                stop_flush_ms,
                grace_ms,
                theme,
            )
            .await
        }
        Commands::Rollout { deployment, revision, timeout_secs, poll, poll_delay_ms } => {
            run_rollout(cli.output, client, &scope, &deployment, &revision, timeout_secs, poll, poll_delay_ms).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_watch_interval_parses() {
        let cli = Cli::try_parse_from(["rollwatchctl", "logs", "web", "--watch-interval", "-1", "--theme", "gray"]).unwrap();
        match cli.command {
            Commands::Logs { workload, watch_interval, theme, .. } => {
                assert_eq!(workload, "web");
                assert_eq!(watch_interval, -1);
                assert_eq!(PrefixTheme::from(theme), PrefixTheme::Gray);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rollout_accepts_noop_and_global_flags() {
        let cli = Cli::try_parse_from(["rollwatchctl", "rollout", "web", "noop", "-o", "json", "--ns", "shop"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("shop"));
        assert!(matches!(cli.command, Commands::Rollout { ref revision, poll: false, .. } if revision == "noop"));
    }

    #[test]
    fn outcome_names() {
        assert_eq!(outcome_of(&Ok(())), "complete");
        assert_eq!(outcome_of(&Err(WatchError::Timeout)), "timeout");
        assert_eq!(outcome_of(&Err(WatchError::Failed("x".into()))), "failed");
        assert_eq!(outcome_of(&Err(WatchError::Cancelled { reason: "r".into() })), "cancelled");
    }
}
