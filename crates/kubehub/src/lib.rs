//! Rollwatch kubehub: everything that talks to the Kubernetes API.
//!
//! Client resolution, the pod log `StreamGetter`, label-selector pod
//! discovery, and the Deployment / Event watch streams used by the rollout
//! watcher.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::Api;
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use rollwatch_core::InitError;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod deployments;
pub mod events;
pub mod pods;

pub use deployments::{deployment_updates, DeploymentUpdate};
pub use events::{event_lines, narration_for};
pub use pods::{not_ready_reason, pod_info_from, KubePodDiscovery, KubeStreamGetter};

pub const SOURCE_TYPE: &str = "kubernetes";

/// Which cluster and namespace to talk to; `None` means kubeconfig/in-cluster defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub context: Option<String>,
    pub namespace: Option<String>,
}

impl ClientConfig {
    pub fn new(context: Option<String>, namespace: Option<String>) -> Self {
        Self { context, namespace }
    }

    async fn config(&self) -> Result<Config> {
        match &self.context {
            Some(ctx) => {
                let opts = KubeConfigOptions { context: Some(ctx.clone()), ..KubeConfigOptions::default() };
                Config::from_kubeconfig(&opts)
                    .await
                    .with_context(|| format!("loading kube context {ctx}"))
            }
            None => Config::infer().await.context("inferring kube config"),
        }
    }

    /// Build a client and resolve the namespace.
    pub async fn connect(&self) -> Result<KubeContext, InitError> {
        let id = self.context.clone().unwrap_or_else(|| "default-context".to_string());
        let config = self.config().await.map_err(|e| InitError::new(SOURCE_TYPE, &id, e))?;
        let namespace = self.namespace.clone().unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config)
            .context("building kube client")
            .map_err(|e| InitError::new(SOURCE_TYPE, &id, e))?;
        info!(context = %id, ns = %namespace, "kube client ready");
        Ok(KubeContext { client, namespace })
    }
}

/// A connected client bound to one namespace.
#[derive(Clone)]
pub struct KubeContext {
    client: Client,
    namespace: String,
}

impl KubeContext {
    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self { client, namespace: namespace.to_string() }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn stream_getter(&self) -> KubeStreamGetter {
        KubeStreamGetter::new(self.pods())
    }

    pub fn pod_discovery(&self) -> KubePodDiscovery {
        KubePodDiscovery::new(self.pods())
    }
}
