//! Keeps deployed applications running.

mod local;
mod systemd;

pub use local::LocalSupervisor;
pub use systemd::SystemdSupervisor;

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;

use crate::error::DeployResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Failed,
    /// No service is registered under this name.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub app_name: String,
    pub start_command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Service name used for an app in the supervisor.
pub fn service_name(app_name: &str) -> String {
    format!("shipyard-{app_name}")
}

/// Every method is keyed by app name. Stop and remove treat a missing service as done.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    /// Create or replace the service definition. Does not start it.
    async fn register_service(&self, spec: &ServiceSpec) -> DeployResult<()>;
    /// Start the service, restarting it if it is already running.
    async fn start_service(&self, app_name: &str) -> DeployResult<()>;
    async fn stop_service(&self, app_name: &str) -> DeployResult<()>;
    async fn remove_service(&self, app_name: &str) -> DeployResult<()>;
    async fn service_status(&self, app_name: &str) -> DeployResult<ServiceState>;
    /// Up to `lines` of the service's most recent output, oldest first. Empty
    /// for a missing service.
    async fn service_logs(&self, app_name: &str, lines: usize) -> DeployResult<Vec<String>>;
}
