//! Durable FIFO of deploy jobs with a single worker.
//!
//! `enqueue` validates, persists a `queued` job and wakes the worker; it never
//! runs pipeline code. The worker takes jobs strictly in id order, so at most
//! one job is `building` at any time.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use shipyard_job::{DeployMode, DomainSpec, Job, JobId, JobStatus, RuntimeSpec, Source, Stage};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};

use crate::broker::{LogBroker, Subscription};
use crate::error::{DeployError, DeployResult};
use crate::pipeline::{Pipeline, Progress};
use crate::store::{JobUpdate, Store};
use crate::workspace::UploadStore;

pub const MAX_APP_NAME_LEN: usize = 64;
const MAX_HISTORY: usize = 200;
const INTERRUPTED: &str = "interrupted by control-plane restart";

#[derive(Debug, Clone)]
pub enum RequestSource {
    Git { repository: String, branch: String },
    /// A freshly uploaded zip archive.
    Archive(Vec<u8>),
    /// An archive retained from an earlier deploy.
    Upload(String),
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub app_name: String,
    pub mode: DeployMode,
    pub source: RequestSource,
    pub runtime: RuntimeSpec,
    pub domains: Vec<DomainSpec>,
}

pub fn validate_app_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }
    if name.len() > MAX_APP_NAME_LEN {
        return Err(format!("must be at most {MAX_APP_NAME_LEN} characters"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err("must start with a letter or digit".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("may only contain letters, digits, '-' and '_'".to_string());
    }
    Ok(())
}

fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn bad_ref(value: &str) -> bool {
    value.is_empty() || value.starts_with('-') || value.chars().any(char::is_whitespace)
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    /// Queued or building jobs and their app.
    active: BTreeMap<JobId, String>,
    next_id: i64,
}

struct Inner {
    store: Arc<dyn Store>,
    broker: LogBroker,
    pipeline: Pipeline,
    uploads: UploadStore,
    state: Mutex<QueueState>,
    wake: Notify,
    /// Serializes validate-then-insert so two creates for one name can't both pass.
    /// Also held across app teardown, so nothing is admitted for an app mid-delete.
    admit: AsyncMutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

/// Records stage transitions, flushing the output gathered so far so a build
/// cut short by a restart keeps its logs.
struct StoreProgress {
    store: Arc<dyn Store>,
    broker: LogBroker,
}

#[async_trait]
impl Progress for StoreProgress {
    async fn stage_entered(&self, job_id: JobId, stage: Stage) {
        let update = JobUpdate {
            logs: self.broker.snapshot(job_id),
            ..JobUpdate::stage(stage)
        };
        if let Err(err) = self
            .store
            .update_job_status(job_id, JobStatus::Building, update)
            .await
        {
            tracing::warn!(%job_id, %stage, error = %err, "failed to record stage");
        }
    }
}

impl QueueManager {
    /// Recover persisted jobs and start the worker.
    pub async fn start(
        store: Arc<dyn Store>,
        broker: LogBroker,
        pipeline: Pipeline,
        uploads: UploadStore,
    ) -> DeployResult<Self> {
        let mut state = QueueState::default();
        for job in store.list_jobs().await? {
            state.next_id = state.next_id.max(job.id.0);
            match job.status {
                JobStatus::Building => {
                    tracing::warn!(
                        job_id = %job.id,
                        app = %job.app_name,
                        "marking interrupted build as failed"
                    );
                    store
                        .update_job_status(
                            job.id,
                            JobStatus::Failed,
                            JobUpdate {
                                completed_at: Some(Utc::now()),
                                error_message: Some(format!(
                                    "{} failed: {INTERRUPTED}",
                                    job.stage.unwrap_or(Stage::Fetch)
                                )),
                                ..JobUpdate::default()
                            },
                        )
                        .await?;
                }
                JobStatus::Queued => {
                    state.pending.push_back(job.id);
                    state.active.insert(job.id, job.app_name.clone());
                }
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        if !state.pending.is_empty() {
            tracing::info!(count = state.pending.len(), "re-queued persisted jobs");
        }

        let manager = Self {
            inner: Arc::new(Inner {
                store,
                broker,
                pipeline,
                uploads,
                state: Mutex::new(state),
                wake: Notify::new(),
                admit: AsyncMutex::new(()),
            }),
        };
        tokio::spawn(manager.clone().worker());
        Ok(manager)
    }

    pub fn broker(&self) -> &LogBroker {
        &self.inner.broker
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn has_active_job(&self, app_name: &str) -> bool {
        self.inner.state().active.values().any(|a| a == app_name)
    }

    /// Block admission of new jobs until the guard is dropped.
    pub async fn exclusive(&self) -> AsyncMutexGuard<'_, ()> {
        self.inner.admit.lock().await
    }

    pub async fn enqueue(&self, request: DeployRequest) -> DeployResult<JobId> {
        let _admit = self.inner.admit.lock().await;
        self.enqueue_admitted(request).await
    }

    /// Enqueue while the caller already holds [`Self::exclusive`].
    pub(crate) async fn enqueue_admitted(&self, request: DeployRequest) -> DeployResult<JobId> {
        self.validate(&request).await?;

        let source = match request.source {
            RequestSource::Git { repository, branch } => Source::Git {
                repository: repository.trim().to_string(),
                branch: branch.trim().to_string(),
            },
            RequestSource::Archive(bytes) => Source::File {
                upload: self.inner.uploads.save(&request.app_name, &bytes).await?,
            },
            RequestSource::Upload(upload) => Source::File { upload },
        };

        let id = {
            let mut state = self.inner.state();
            state.next_id += 1;
            JobId(state.next_id)
        };
        let job = Job {
            id,
            app_name: request.app_name.clone(),
            mode: request.mode,
            source,
            runtime: request.runtime,
            domains: request
                .domains
                .into_iter()
                .map(|d| DomainSpec {
                    domain: d.domain.trim().to_ascii_lowercase(),
                    tls: d.tls,
                })
                .collect(),
            status: JobStatus::Queued,
            stage: None,
            logs: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        self.inner.store.save_job(&job).await?;

        {
            let mut state = self.inner.state();
            state.pending.push_back(id);
            state.active.insert(id, job.app_name.clone());
        }
        self.inner.wake.notify_one();
        tracing::info!(job_id = %id, app = %job.app_name, mode = %job.mode, "job queued");
        Ok(id)
    }

    async fn validate(&self, req: &DeployRequest) -> DeployResult<()> {
        let mut errors = BTreeMap::<String, String>::new();

        if let Err(msg) = validate_app_name(&req.app_name) {
            errors.insert("app_name".to_string(), msg);
        } else {
            let existing = self.inner.store.get_app(&req.app_name).await?;
            match req.mode {
                DeployMode::Create => {
                    if existing.is_some() || self.has_active_job(&req.app_name) {
                        errors.insert("app_name".to_string(), "already in use".to_string());
                    }
                }
                DeployMode::Redeploy => {
                    if existing.is_none() {
                        return Err(DeployError::not_found("app", &req.app_name));
                    }
                }
            }
        }

        match &req.source {
            RequestSource::Git { repository, branch } => {
                if bad_ref(repository.trim()) {
                    errors.insert(
                        "repository".to_string(),
                        "required; must not contain whitespace or start with '-'".to_string(),
                    );
                }
                if bad_ref(branch.trim()) || branch.contains("..") {
                    errors.insert("branch".to_string(), "invalid branch name".to_string());
                }
            }
            RequestSource::Archive(bytes) => {
                if !bytes.starts_with(b"PK") {
                    errors.insert("file".to_string(), "expected a zip archive".to_string());
                }
            }
            RequestSource::Upload(upload) => {
                if !self.inner.uploads.exists(upload).await {
                    errors.insert("file".to_string(), "retained upload is missing".to_string());
                }
            }
        }

        if req.runtime.start_command.trim().is_empty() {
            errors.insert("start_command".to_string(), "required".to_string());
        }
        for (k, v) in &req.runtime.env {
            if !valid_env_key(k) {
                errors.insert(format!("env.{k}"), "invalid variable name".to_string());
            } else if k == "PORT" {
                errors.insert(format!("env.{k}"), "PORT is assigned by shipyard".to_string());
            } else if v.contains(['\n', '\0']) {
                errors.insert(format!("env.{k}"), "value must be a single line".to_string());
            }
        }

        let mut seen = BTreeSet::new();
        let taken = self.inner.store.list_domains().await?;
        for d in &req.domains {
            let domain = d.domain.trim().to_ascii_lowercase();
            if !valid_domain(&domain) {
                errors.insert(format!("domains.{domain}"), "invalid domain".to_string());
            } else if !seen.insert(domain.clone()) {
                errors.insert(format!("domains.{domain}"), "listed twice".to_string());
            } else if let Some(owner) = taken
                .iter()
                .find(|r| r.domain == domain && r.app_name != req.app_name)
            {
                errors.insert(
                    format!("domains.{domain}"),
                    format!("already routed to {}", owner.app_name),
                );
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        let message = match errors.len() {
            1 => errors
                .iter()
                .next()
                .map(|(field, msg)| format!("{field}: {msg}"))
                .unwrap_or_default(),
            n => format!("{n} fields are invalid"),
        };
        Err(DeployError::Validation {
            message,
            field_errors: errors,
        })
    }

    /// Snapshot of a job. Output of the job in flight comes from the broker.
    pub async fn status(&self, id: JobId) -> DeployResult<Job> {
        let mut job = self
            .inner
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| DeployError::not_found("job", id))?;
        if let Some(live) = self.inner.broker.snapshot(id) {
            job.logs = live;
        }
        Ok(job)
    }

    /// Every job, ascending id.
    pub async fn list_all(&self) -> DeployResult<Vec<Job>> {
        let mut jobs = self.inner.store.list_jobs().await?;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Building) {
            if let Some(live) = self.inner.broker.snapshot(job.id) {
                job.logs = live;
            }
        }
        Ok(jobs)
    }

    /// Newest-first deployment history of one app.
    pub async fn history(&self, app_name: &str, limit: usize) -> DeployResult<Vec<Job>> {
        self.inner
            .store
            .jobs_for_app(app_name, limit.clamp(1, MAX_HISTORY))
            .await
    }

    /// Stream a job's output: replay, live chunks, then an end marker.
    pub async fn subscribe(&self, id: JobId) -> DeployResult<Subscription> {
        {
            // Opening under the queue lock can't race with the worker finishing the job.
            let state = self.inner.state();
            if state.active.contains_key(&id) {
                self.inner.broker.open(id);
                if let Some(sub) = self.inner.broker.subscribe(id) {
                    return Ok(sub);
                }
            }
        }

        let job = self
            .inner
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| DeployError::not_found("job", id))?;
        Ok(self
            .inner
            .broker
            .replay_finished(id, &job.logs, job.status, job.error_message))
    }

    async fn worker(self) {
        tracing::info!("deploy worker started");
        loop {
            let next = self.inner.state().pending.pop_front();
            match next {
                Some(id) => self.process(id).await,
                None => self.inner.wake.notified().await,
            }
        }
    }

    async fn process(&self, id: JobId) {
        let inner = &self.inner;
        let job = match inner.store.get_job(id).await {
            Ok(Some(job)) if job.status == JobStatus::Queued => job,
            Ok(other) => {
                tracing::warn!(
                    job_id = %id,
                    status = ?other.map(|j| j.status),
                    "skipping job that is not queued"
                );
                self.release(id);
                return;
            }
            Err(err) => {
                tracing::error!(job_id = %id, error = %err, "failed to load job");
                self.release(id);
                return;
            }
        };

        inner.broker.open(id);
        let started = inner
            .store
            .update_job_status(
                id,
                JobStatus::Building,
                JobUpdate {
                    started_at: Some(Utc::now()),
                    ..JobUpdate::default()
                },
            )
            .await;
        if let Err(err) = started {
            tracing::error!(job_id = %id, error = %err, "failed to mark job building");
        }
        tracing::info!(job_id = %id, app = %job.app_name, "build started");

        let sink = inner.broker.sink(id);
        let pipeline = inner.pipeline.clone();
        let progress = StoreProgress {
            store: inner.store.clone(),
            broker: inner.broker.clone(),
        };
        let task_sink = sink.clone();
        let task_job = job.clone();
        let handle =
            tokio::spawn(async move { pipeline.run(&task_job, &task_sink, &progress).await });

        let (status, error_message) = match handle.await {
            Ok(Ok(_record)) => (JobStatus::Completed, None),
            Ok(Err(err)) => {
                sink.note(err.job_message());
                (JobStatus::Failed, Some(err.job_message()))
            }
            Err(join) => {
                let stage = inner
                    .store
                    .get_job(id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|j| j.stage)
                    .unwrap_or(Stage::Fetch);
                let msg = format!("{stage} failed: pipeline task aborted: {join}");
                sink.note(&msg);
                (JobStatus::Failed, Some(msg))
            }
        };

        let logs = inner.broker.snapshot(id).unwrap_or_default();
        let finished = inner
            .store
            .update_job_status(
                id,
                status,
                JobUpdate {
                    logs: Some(logs),
                    completed_at: Some(Utc::now()),
                    error_message: error_message.clone(),
                    ..JobUpdate::default()
                },
            )
            .await;
        if let Err(err) = finished {
            tracing::error!(job_id = %id, error = %err, "failed to persist job result");
        }

        match status {
            JobStatus::Completed => {
                tracing::info!(job_id = %id, app = %job.app_name, "job completed")
            }
            _ => tracing::warn!(
                job_id = %id,
                app = %job.app_name,
                error = error_message.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }

        let mut state = inner.state();
        state.active.remove(&id);
        inner.broker.finish(id, status, error_message);
    }

    fn release(&self, id: JobId) {
        self.inner.state().active.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_rules() {
        assert!(validate_app_name("web-1_api").is_ok());
        assert!(validate_app_name("9lives").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("-web").is_err());
        assert!(validate_app_name("_web").is_err());
        assert!(validate_app_name("web app").is_err());
        assert!(validate_app_name("../etc").is_err());
        assert!(validate_app_name(&"a".repeat(65)).is_err());
        assert!(validate_app_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn env_keys_and_domains() {
        assert!(valid_env_key("NODE_ENV"));
        assert!(valid_env_key("_X1"));
        assert!(!valid_env_key("1X"));
        assert!(!valid_env_key("A-B"));

        assert!(valid_domain("app.example.com"));
        assert!(valid_domain("localhost"));
        assert!(!valid_domain("bad..example.com"));
        assert!(!valid_domain("-x.example.com"));
        assert!(!valid_domain("x y.example.com"));
    }
}
