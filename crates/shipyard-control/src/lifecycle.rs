use std::sync::Arc;

use shipyard_job::{
    AppRecord, AppState, DeployMode, DomainRecord, DomainSpec, JobId, JobStatus, Source,
};

use crate::error::{DeployError, DeployResult};
use crate::proxy::ReverseProxy;
use crate::queue::{DeployRequest, QueueManager, RequestSource};
use crate::supervisor::{ServiceState, ServiceSupervisor};
use crate::workspace::{UploadStore, Workspaces};

/// What the API reports for one app.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppView {
    pub name: String,
    pub state: AppState,
    pub record: Option<AppRecord>,
    pub domains: Vec<DomainRecord>,
    pub service: ServiceState,
    pub latest_job: Option<JobId>,
}

/// Cap on service log lines returned in one request.
pub const MAX_LOG_LINES: usize = 1000;

/// Operations on apps that already exist, plus the derived app state.
#[derive(Clone)]
pub struct Lifecycle {
    queue: QueueManager,
    supervisor: Arc<dyn ServiceSupervisor>,
    proxy: Arc<dyn ReverseProxy>,
    workspaces: Workspaces,
    uploads: UploadStore,
}

impl Lifecycle {
    pub fn new(
        queue: QueueManager,
        supervisor: Arc<dyn ServiceSupervisor>,
        proxy: Arc<dyn ReverseProxy>,
        workspaces: Workspaces,
        uploads: UploadStore,
    ) -> Self {
        Self {
            queue,
            supervisor,
            proxy,
            workspaces,
            uploads,
        }
    }

    async fn record(&self, app_name: &str) -> DeployResult<AppRecord> {
        self.queue
            .store()
            .get_app(app_name)
            .await?
            .ok_or_else(|| DeployError::not_found("app", app_name))
    }

    async fn current_domains(&self, app_name: &str) -> DeployResult<Vec<DomainSpec>> {
        Ok(self
            .queue
            .store()
            .domains_for_app(app_name)
            .await?
            .into_iter()
            .map(|d| DomainSpec {
                domain: d.domain,
                tls: d.tls,
            })
            .collect())
    }

    fn ensure_idle(&self, app_name: &str) -> DeployResult<()> {
        if self.queue.has_active_job(app_name) {
            return Err(DeployError::validation(
                "app_name",
                "app has a deployment in progress",
            ));
        }
        Ok(())
    }

    fn redeploy_request(record: AppRecord, domains: Vec<DomainSpec>) -> DeployRequest {
        let source = match record.source {
            Source::Git { repository, branch } => RequestSource::Git { repository, branch },
            Source::File { upload } => RequestSource::Upload(upload),
        };
        DeployRequest {
            app_name: record.name,
            mode: DeployMode::Redeploy,
            source,
            runtime: record.runtime,
            domains,
        }
    }

    /// Queue a fresh build of an existing app from its stored configuration.
    pub async fn redeploy(&self, app_name: &str) -> DeployResult<JobId> {
        let record = self.record(app_name).await?;
        let domains = self.current_domains(app_name).await?;
        self.queue.enqueue(Self::redeploy_request(record, domains)).await
    }

    /// Queue a redeploy that routes exactly `domains` to the app.
    pub async fn set_domains(
        &self,
        app_name: &str,
        domains: Vec<DomainSpec>,
    ) -> DeployResult<JobId> {
        let _admit = self.queue.exclusive().await;
        let record = self.record(app_name).await?;
        self.ensure_idle(app_name)?;
        self.queue.enqueue_admitted(Self::redeploy_request(record, domains)).await
    }

    /// Queue a redeploy with one more route. An existing route for the same
    /// domain has its TLS setting replaced.
    pub async fn add_domain(&self, app_name: &str, domain: DomainSpec) -> DeployResult<JobId> {
        let _admit = self.queue.exclusive().await;
        let record = self.record(app_name).await?;
        self.ensure_idle(app_name)?;
        let wanted = domain.domain.trim().to_ascii_lowercase();
        let mut domains = self.current_domains(app_name).await?;
        if domains.iter().any(|d| d.domain == wanted && d.tls == domain.tls) {
            return Err(DeployError::validation(
                &format!("domains.{wanted}"),
                "already routed to this app",
            ));
        }
        domains.retain(|d| d.domain != wanted);
        domains.push(DomainSpec {
            domain: wanted,
            tls: domain.tls,
        });
        self.queue.enqueue_admitted(Self::redeploy_request(record, domains)).await
    }

    /// Queue a redeploy without the route for `domain`.
    pub async fn remove_domain(&self, app_name: &str, domain: &str) -> DeployResult<JobId> {
        let _admit = self.queue.exclusive().await;
        let record = self.record(app_name).await?;
        self.ensure_idle(app_name)?;
        let unwanted = domain.trim().to_ascii_lowercase();
        let mut domains = self.current_domains(app_name).await?;
        let before = domains.len();
        domains.retain(|d| d.domain != unwanted);
        if domains.len() == before {
            return Err(DeployError::not_found("domain", unwanted));
        }
        self.queue.enqueue_admitted(Self::redeploy_request(record, domains)).await
    }

    /// Start the app's service if it is not already running.
    pub async fn start(&self, app_name: &str) -> DeployResult<ServiceState> {
        let _admit = self.queue.exclusive().await;
        self.record(app_name).await?;
        self.ensure_idle(app_name)?;
        if self.supervisor.service_status(app_name).await? != ServiceState::Running {
            self.supervisor.start_service(app_name).await?;
            tracing::info!(app = app_name, "service started");
        }
        self.supervisor.service_status(app_name).await
    }

    pub async fn stop(&self, app_name: &str) -> DeployResult<ServiceState> {
        let _admit = self.queue.exclusive().await;
        self.record(app_name).await?;
        self.ensure_idle(app_name)?;
        self.supervisor.stop_service(app_name).await?;
        tracing::info!(app = app_name, "service stopped");
        self.supervisor.service_status(app_name).await
    }

    pub async fn restart(&self, app_name: &str) -> DeployResult<ServiceState> {
        let _admit = self.queue.exclusive().await;
        self.record(app_name).await?;
        self.ensure_idle(app_name)?;
        self.supervisor.start_service(app_name).await?;
        tracing::info!(app = app_name, "service restarted");
        self.supervisor.service_status(app_name).await
    }

    /// Recent output of the running service, not of its builds.
    pub async fn service_logs(&self, app_name: &str, lines: usize) -> DeployResult<Vec<String>> {
        self.record(app_name).await?;
        self.supervisor
            .service_logs(app_name, lines.clamp(1, MAX_LOG_LINES))
            .await
    }

    /// Tear down everything belonging to an app. Absent pieces are skipped, so
    /// repeating a delete succeeds.
    ///
    /// Admission stays closed for the whole teardown; a redeploy racing the
    /// delete waits and then finds no app.
    pub async fn delete(&self, app_name: &str) -> DeployResult<()> {
        let _admit = self.queue.exclusive().await;
        self.ensure_idle(app_name)?;
        let store = self.queue.store();
        tracing::info!(app = app_name, "deleting app");

        self.supervisor.stop_service(app_name).await?;
        self.supervisor.remove_service(app_name).await?;

        let routes = store.domains_for_app(app_name).await?;
        for route in &routes {
            self.proxy.remove_route(route.id).await?;
        }
        if !routes.is_empty() {
            self.proxy.regenerate_config().await?;
            if !self.proxy.validate_config().await? {
                return Err(DeployError::Registration(
                    "proxy configuration failed validation after removing routes".to_string(),
                ));
            }
            self.proxy.reload().await?;
        }

        store.delete_app(app_name).await?;
        self.workspaces.remove_app(app_name).await?;
        self.uploads.remove_app(app_name).await?;
        tracing::info!(app = app_name, routes = routes.len(), "app deleted");
        Ok(())
    }

    /// `absent -> provisioning -> running | failed`, derived from the record and
    /// the latest job.
    pub async fn app_state(&self, app_name: &str) -> DeployResult<AppState> {
        let store = self.queue.store();
        let latest = store.jobs_for_app(app_name, 1).await?.into_iter().next();
        let has_record = store.get_app(app_name).await?.is_some();
        // A failed first deploy leaves its workspace until the app is deleted.
        let has_workspace = tokio::fs::metadata(self.workspaces.app_dir(app_name))
            .await
            .is_ok();

        Ok(match latest.map(|j| j.status) {
            Some(JobStatus::Queued | JobStatus::Building) => AppState::Provisioning,
            Some(JobStatus::Failed) if has_record || has_workspace => AppState::Failed,
            _ if has_record => AppState::Running,
            _ => AppState::Absent,
        })
    }

    pub async fn view(&self, app_name: &str) -> DeployResult<AppView> {
        let store = self.queue.store();
        let state = self.app_state(app_name).await?;
        let record = store.get_app(app_name).await?;
        let latest_job = store
            .jobs_for_app(app_name, 1)
            .await?
            .first()
            .map(|j| j.id);
        if state == AppState::Absent && latest_job.is_none() {
            return Err(DeployError::not_found("app", app_name));
        }
        Ok(AppView {
            name: app_name.to_string(),
            state,
            record,
            domains: store.domains_for_app(app_name).await?,
            service: self.supervisor.service_status(app_name).await?,
            latest_job,
        })
    }
}
