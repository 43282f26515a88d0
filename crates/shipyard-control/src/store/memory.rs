use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use shipyard_job::{AppRecord, DomainRecord, DomainSpec, Job, JobId, JobStatus};
use tokio::sync::RwLock;

use super::{JobUpdate, Store, check_transition};
use crate::error::{DeployError, DeployResult};

#[derive(Default)]
struct Tables {
    apps: HashMap<String, AppRecord>,
    jobs: BTreeMap<JobId, Job>,
    domains: BTreeMap<i64, DomainRecord>,
    next_domain_id: i64,
}

/// Volatile store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_app(&self, app: &AppRecord) -> DeployResult<()> {
        self.tables
            .write()
            .await
            .apps
            .insert(app.name.clone(), app.clone());
        Ok(())
    }

    async fn get_app(&self, name: &str) -> DeployResult<Option<AppRecord>> {
        Ok(self.tables.read().await.apps.get(name).cloned())
    }

    async fn delete_app(&self, name: &str) -> DeployResult<bool> {
        Ok(self.tables.write().await.apps.remove(name).is_some())
    }

    async fn list_apps(&self) -> DeployResult<Vec<AppRecord>> {
        let mut apps: Vec<AppRecord> = self.tables.read().await.apps.values().cloned().collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    async fn save_job(&self, job: &Job) -> DeployResult<()> {
        self.tables.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: JobUpdate,
    ) -> DeployResult<()> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DeployError::not_found("job", id))?;
        check_transition(id, job.status, status)?;
        update.apply(job, status);
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> DeployResult<Option<Job>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> DeployResult<Vec<Job>> {
        Ok(self.tables.read().await.jobs.values().cloned().collect())
    }

    async fn jobs_for_app(&self, app: &str, limit: usize) -> DeployResult<Vec<Job>> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .values()
            .rev()
            .filter(|j| j.app_name == app)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_domain(
        &self,
        app: &str,
        domain: &DomainSpec,
        upstream_port: u16,
    ) -> DeployResult<DomainRecord> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .domains
            .values_mut()
            .find(|d| d.domain == domain.domain)
        {
            if existing.app_name != app {
                return Err(DeployError::Registration(format!(
                    "domain {} is already routed to {}",
                    domain.domain, existing.app_name
                )));
            }
            existing.tls = domain.tls;
            existing.upstream_port = upstream_port;
            return Ok(existing.clone());
        }

        tables.next_domain_id += 1;
        let record = DomainRecord {
            id: tables.next_domain_id,
            app_name: app.to_string(),
            domain: domain.domain.clone(),
            tls: domain.tls,
            upstream_port,
            created_at: chrono::Utc::now(),
        };
        tables.domains.insert(record.id, record.clone());
        Ok(record)
    }

    async fn delete_domain(&self, id: i64) -> DeployResult<bool> {
        Ok(self.tables.write().await.domains.remove(&id).is_some())
    }

    async fn domains_for_app(&self, app: &str) -> DeployResult<Vec<DomainRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .domains
            .values()
            .filter(|d| d.app_name == app)
            .cloned()
            .collect())
    }

    async fn list_domains(&self) -> DeployResult<Vec<DomainRecord>> {
        Ok(self.tables.read().await.domains.values().cloned().collect())
    }
}
