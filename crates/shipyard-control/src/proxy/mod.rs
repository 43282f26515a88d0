//! Public routing of domains to app upstreams.

mod caddy;

pub use caddy::CaddyProxy;

use async_trait::async_trait;
use shipyard_job::{DomainRecord, DomainSpec};

use crate::error::DeployResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub app_name: String,
    pub domain: DomainSpec,
    pub upstream_port: u16,
}

/// Route changes are staged by `add_route`/`remove_route` and only take effect
/// after `regenerate_config` + `reload`.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    async fn add_route(&self, route: &Route) -> DeployResult<DomainRecord>;
    /// Removing an unknown route succeeds.
    async fn remove_route(&self, domain_id: i64) -> DeployResult<()>;
    async fn regenerate_config(&self) -> DeployResult<()>;
    async fn validate_config(&self) -> DeployResult<bool>;
    async fn reload(&self) -> DeployResult<()>;
}
