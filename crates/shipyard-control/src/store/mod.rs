//! Persistence for jobs, app records and proxy routes.

mod db;
mod memory;

pub use db::SeaOrmStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_job::{AppRecord, DomainRecord, DomainSpec, Job, JobId, JobStatus, Stage};

use crate::error::{DeployError, DeployResult};

fn check_transition(id: JobId, from: JobStatus, to: JobStatus) -> DeployResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DeployError::InvalidTransition { id, from, to })
    }
}

/// Fields written alongside a status change. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub stage: Option<Stage>,
    pub logs: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    fn apply(self, job: &mut Job, status: JobStatus) {
        job.status = status;
        if let Some(stage) = self.stage {
            job.stage = Some(stage);
        }
        if let Some(logs) = self.logs {
            job.logs = logs;
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(msg) = self.error_message {
            job.error_message = Some(msg);
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace the record for `app.name`.
    async fn save_app(&self, app: &AppRecord) -> DeployResult<()>;
    async fn get_app(&self, name: &str) -> DeployResult<Option<AppRecord>>;
    /// Returns whether a record was removed.
    async fn delete_app(&self, name: &str) -> DeployResult<bool>;
    async fn list_apps(&self) -> DeployResult<Vec<AppRecord>>;

    async fn save_job(&self, job: &Job) -> DeployResult<()>;
    /// Fails with [`DeployError::InvalidTransition`] for an illegal status change.
    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: JobUpdate,
    ) -> DeployResult<()>;
    async fn get_job(&self, id: JobId) -> DeployResult<Option<Job>>;
    /// All jobs, ascending id.
    async fn list_jobs(&self) -> DeployResult<Vec<Job>>;
    /// Jobs of one app, newest first.
    async fn jobs_for_app(&self, app: &str, limit: usize) -> DeployResult<Vec<Job>>;

    /// Insert a route, or update tls/upstream of an existing one for the same domain.
    async fn save_domain(
        &self,
        app: &str,
        domain: &DomainSpec,
        upstream_port: u16,
    ) -> DeployResult<DomainRecord>;
    async fn delete_domain(&self, id: i64) -> DeployResult<bool>;
    async fn domains_for_app(&self, app: &str) -> DeployResult<Vec<DomainRecord>>;
    async fn list_domains(&self) -> DeployResult<Vec<DomainRecord>>;
}
