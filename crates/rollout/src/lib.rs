//! Rollwatch rollout: wait for a rollout to reach a terminal status.
//!
//! `PollingDeployWatcher` probes any `DeployStatusGetter` on a fixed delay;
//! `KubernetesDeployWatcher` subscribes to a Deployment and maps each update
//! to a `RolloutStatus`.

#![forbid(unsafe_code)]

pub mod kubernetes;
pub mod polling;

pub use kubernetes::{
    deployment_status, drive, revision_of, verify_revision, DeploymentStatusGetter, KubernetesDeployWatcher, StatusReport,
};
pub use polling::PollingDeployWatcher;
