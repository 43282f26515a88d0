use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use shipyard_job::DomainRecord;
use tokio::process::Command;

use super::{ReverseProxy, Route};
use crate::error::{DeployError, DeployResult};
use crate::store::Store;

const CADDY_TIMEOUT: Duration = Duration::from_secs(60);

/// Caddy driven through a generated Caddyfile. Routes live in the store.
pub struct CaddyProxy {
    store: Arc<dyn Store>,
    caddyfile: PathBuf,
    caddy_bin: String,
}

impl CaddyProxy {
    pub fn new(
        store: Arc<dyn Store>,
        caddyfile: impl Into<PathBuf>,
        caddy_bin: impl Into<String>,
    ) -> Self {
        Self {
            store,
            caddyfile: caddyfile.into(),
            caddy_bin: caddy_bin.into(),
        }
    }

    async fn caddy(&self, subcommand: &str) -> DeployResult<std::process::Output> {
        let config = self.caddyfile.to_string_lossy().into_owned();
        let mut cmd = Command::new(&self.caddy_bin);
        cmd.args([subcommand, "--config", &config, "--adapter", "caddyfile"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tokio::time::timeout(CADDY_TIMEOUT, cmd.output())
            .await
            .map_err(|_| DeployError::Registration(format!("caddy {subcommand} timed out")))?
            .map_err(|e| {
                DeployError::Registration(format!("run {} {subcommand}: {e}", self.caddy_bin))
            })
    }
}

/// Hosts that can never get a public certificate.
fn is_private_host(domain: &str) -> bool {
    domain == "localhost"
        || domain.ends_with(".localhost")
        || domain.ends_with(".local")
        || domain.ends_with(".internal")
        || domain.parse::<std::net::IpAddr>().is_ok()
}

pub(crate) fn render_caddyfile(routes: &[DomainRecord]) -> String {
    let mut out = String::from("# Managed by shipyard. Manual edits are overwritten.\n");
    for r in routes {
        out.push('\n');
        if r.tls {
            out.push_str(&format!("{} {{\n", r.domain));
            if is_private_host(&r.domain) {
                out.push_str("\ttls internal\n");
            }
        } else {
            out.push_str(&format!("http://{} {{\n", r.domain));
        }
        out.push_str(&format!("\treverse_proxy 127.0.0.1:{}\n", r.upstream_port));
        out.push_str("}\n");
    }
    out
}

#[async_trait]
impl ReverseProxy for CaddyProxy {
    async fn add_route(&self, route: &Route) -> DeployResult<DomainRecord> {
        self.store
            .save_domain(&route.app_name, &route.domain, route.upstream_port)
            .await
    }

    async fn remove_route(&self, domain_id: i64) -> DeployResult<()> {
        self.store.delete_domain(domain_id).await?;
        Ok(())
    }

    async fn regenerate_config(&self) -> DeployResult<()> {
        let routes = self.store.list_domains().await?;
        if let Some(parent) = self.caddyfile.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.caddyfile.with_extension("tmp");
        tokio::fs::write(&tmp, render_caddyfile(&routes)).await?;
        tokio::fs::rename(&tmp, &self.caddyfile).await?;
        tracing::debug!(
            routes = routes.len(),
            path = %self.caddyfile.display(),
            "caddyfile written"
        );
        Ok(())
    }

    async fn validate_config(&self) -> DeployResult<bool> {
        let out = self.caddy("validate").await?;
        if !out.status.success() {
            tracing::warn!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "caddy rejected the generated config"
            );
        }
        Ok(out.status.success())
    }

    async fn reload(&self) -> DeployResult<()> {
        let out = self.caddy("reload").await?;
        if !out.status.success() {
            return Err(DeployError::Registration(format!(
                "caddy reload failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        tracing::info!("caddy reloaded");
        Ok(())
    }
}
