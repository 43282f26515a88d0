//! The fixed build-and-deploy sequence for one job.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shipyard_job::{AppRecord, DeployMode, DomainRecord, DomainSpec, Job, JobId, Source, Stage};

use crate::broker::LogSink;
use crate::error::{DeployError, DeployResult, StageContext, StageError};
use crate::port_alloc::allocate_tcp_port;
use crate::proxy::{ReverseProxy, Route};
use crate::runner::{self, ShellCommand};
use crate::source::SourceFetcher;
use crate::store::Store;
use crate::supervisor::{ServiceSpec, ServiceSupervisor};
use crate::workspace::{UploadStore, Workspaces, remove_dir_if_exists};

/// Receives stage transitions while a job runs.
#[async_trait]
pub trait Progress: Send + Sync {
    async fn stage_entered(&self, job_id: JobId, stage: Stage);
}

#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub supervisor: Arc<dyn ServiceSupervisor>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub workspaces: Workspaces,
    pub uploads: UploadStore,
    pub command_timeout: Duration,
}

type StageResult<T> = Result<T, StageError>;

struct Run<'a> {
    job: &'a Job,
    sink: &'a LogSink,
    progress: &'a dyn Progress,
    previous: Option<AppRecord>,
}

impl Run<'_> {
    async fn enter(&self, stage: Stage) {
        tracing::info!(job_id = %self.job.id, app = %self.job.app_name, %stage, "stage started");
        self.sink.note(format!("==> {stage}"));
        self.progress.stage_entered(self.job.id, stage).await;
    }
}

fn domain_set(domains: &[DomainSpec]) -> BTreeSet<(String, bool)> {
    domains
        .iter()
        .map(|d| (d.domain.trim().to_ascii_lowercase(), d.tls))
        .collect()
}

fn record_set(records: &[DomainRecord]) -> BTreeSet<(String, bool)> {
    records
        .iter()
        .map(|d| (d.domain.to_ascii_lowercase(), d.tls))
        .collect()
}

impl Pipeline {
    /// Run every stage for `job`, failing fast. Returns the persisted app record.
    pub async fn run(
        &self,
        job: &Job,
        sink: &LogSink,
        progress: &dyn Progress,
    ) -> StageResult<AppRecord> {
        let previous = self.store.get_app(&job.app_name).await.stage(Stage::Fetch)?;
        if job.mode == DeployMode::Redeploy && previous.is_none() {
            return Err(StageError::new(
                Stage::Fetch,
                DeployError::not_found("app", &job.app_name),
            ));
        }
        let run = Run {
            job,
            sink,
            progress,
            previous,
        };

        let workspace = self.fetch(&run).await?;
        let port = self.allocate_port(&run).await.stage(Stage::Fetch)?;
        let mut env: BTreeMap<String, String> = job.runtime.env.clone();
        env.insert("PORT".to_string(), port.to_string());

        run.enter(Stage::Install).await;
        self.shell(job.runtime.install_command(), &workspace, &env, sink)
            .await
            .stage(Stage::Install)?;

        run.enter(Stage::Build).await;
        match job.runtime.build_command() {
            Some(cmd) => self
                .shell(cmd, &workspace, &env, sink)
                .await
                .stage(Stage::Build)?,
            None => sink.note("no build command; skipping"),
        }

        run.enter(Stage::Service).await;
        self.register_service(&run, &workspace, &env)
            .await
            .stage(Stage::Service)?;

        let finish = async {
            run.enter(Stage::Proxy).await;
            self.register_routes(&run, port).await.stage(Stage::Proxy)?;

            run.enter(Stage::Persist).await;
            self.persist(&run, port, &workspace)
                .await
                .stage(Stage::Persist)
        };

        match finish.await {
            Ok(record) => {
                sink.note(format!("deployed {} on port {port}", job.app_name));
                Ok(record)
            }
            Err(err) => {
                // A first deploy must not leave an orphaned service behind.
                if run.previous.is_none() {
                    sink.note("removing service of failed first deploy");
                    if let Err(e) = self.supervisor.remove_service(&job.app_name).await {
                        tracing::warn!(app = %job.app_name, error = %e, "service rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn shell(
        &self,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        sink: &LogSink,
    ) -> DeployResult<()> {
        sink.note(format!("$ {command}"));
        runner::run_checked(
            &ShellCommand {
                command,
                cwd,
                env,
                timeout: self.command_timeout,
            },
            sink,
        )
        .await?;
        Ok(())
    }

    async fn fetch(&self, run: &Run<'_>) -> StageResult<PathBuf> {
        run.enter(Stage::Fetch).await;
        let job = run.job;
        let keep = run.previous.as_ref().map(|p| p.workspace.as_path());
        let dir = self
            .workspaces
            .prepare(&job.app_name, job.id, keep)
            .await
            .stage(Stage::Fetch)?;
        run.sink.note(format!("workspace {}", dir.display()));

        match &job.source {
            Source::Git { repository, branch } => self
                .fetcher
                .clone_or_checkout(repository, branch, &dir, run.sink)
                .await
                .stage(Stage::Fetch)?,
            Source::File { upload } => {
                if !self.uploads.exists(upload).await {
                    return Err(StageError::new(
                        Stage::Fetch,
                        DeployError::Fetch(format!("uploaded archive {upload} is missing")),
                    ));
                }
                let archive = self.uploads.path(upload).stage(Stage::Fetch)?;
                run.sink.note("extracting uploaded archive");
                self.fetcher
                    .extract_archive(&archive, &dir)
                    .await
                    .stage(Stage::Fetch)?;
            }
        }
        Ok(dir)
    }

    async fn allocate_port(&self, run: &Run<'_>) -> DeployResult<u16> {
        let taken: HashSet<u16> = self
            .store
            .list_apps()
            .await?
            .into_iter()
            .filter(|a| a.name != run.job.app_name)
            .map(|a| a.port)
            .collect();
        allocate_tcp_port(run.previous.as_ref().map(|p| p.port), &taken)
    }

    async fn register_service(
        &self,
        run: &Run<'_>,
        workspace: &Path,
        env: &BTreeMap<String, String>,
    ) -> DeployResult<()> {
        let job = run.job;
        let spec = ServiceSpec {
            app_name: job.app_name.clone(),
            start_command: job.runtime.start_command.clone(),
            cwd: workspace.to_path_buf(),
            env: env.clone(),
        };
        self.supervisor.register_service(&spec).await?;
        self.supervisor.start_service(&job.app_name).await?;
        run.sink.note(format!("service started: {}", job.runtime.start_command));

        // The supervisor now runs from the new workspace; keep the record pointing at it.
        if let Some(prev) = &run.previous
            && prev.workspace != workspace
        {
            let mut moved = prev.clone();
            moved.workspace = workspace.to_path_buf();
            moved.updated_at = Utc::now();
            self.store.save_app(&moved).await?;
            remove_dir_if_exists(&prev.workspace).await?;
        }
        Ok(())
    }

    async fn register_routes(&self, run: &Run<'_>, port: u16) -> DeployResult<()> {
        let job = run.job;
        let current = self.store.domains_for_app(&job.app_name).await?;
        let wanted = domain_set(&job.domains);

        if wanted.is_empty() && current.is_empty() {
            run.sink.note("no domains requested; skipping proxy");
            return Ok(());
        }
        if job.mode == DeployMode::Redeploy && wanted == record_set(&current) {
            run.sink.note("domains unchanged; skipping proxy");
            return Ok(());
        }

        let stale: Vec<&DomainRecord> = current
            .iter()
            .filter(|r| !wanted.contains(&(r.domain.to_ascii_lowercase(), r.tls)))
            .collect();
        let mut added = Vec::new();
        let applied: DeployResult<()> = async {
            for record in &stale {
                self.proxy.remove_route(record.id).await?;
            }
            for (domain, tls) in &wanted {
                let rec = self
                    .proxy
                    .add_route(&Route {
                        app_name: job.app_name.clone(),
                        domain: DomainSpec {
                            domain: domain.clone(),
                            tls: *tls,
                        },
                        upstream_port: port,
                    })
                    .await?;
                run.sink.note(format!(
                    "route {}{domain} -> 127.0.0.1:{port}",
                    if *tls { "https://" } else { "http://" }
                ));
                added.push(rec);
            }
            self.proxy.regenerate_config().await?;
            if !self.proxy.validate_config().await? {
                return Err(DeployError::Registration(
                    "generated proxy configuration failed validation".to_string(),
                ));
            }
            self.proxy.reload().await
        }
        .await;

        if let Err(err) = applied {
            run.sink.note("restoring previous routes");
            self.restore_routes(&job.app_name, &current, &added).await;
            return Err(err);
        }
        Ok(())
    }

    /// Best-effort return to the route set that was live before this job.
    async fn restore_routes(&self, app: &str, before: &[DomainRecord], added: &[DomainRecord]) {
        let before_ids: HashSet<i64> = before.iter().map(|r| r.id).collect();
        for rec in added.iter().filter(|r| !before_ids.contains(&r.id)) {
            if let Err(e) = self.proxy.remove_route(rec.id).await {
                tracing::warn!(app, domain = %rec.domain, error = %e, "failed to drop new route");
            }
        }
        for rec in before {
            let route = Route {
                app_name: app.to_string(),
                domain: DomainSpec {
                    domain: rec.domain.clone(),
                    tls: rec.tls,
                },
                upstream_port: rec.upstream_port,
            };
            if let Err(e) = self.proxy.add_route(&route).await {
                tracing::warn!(app, domain = %rec.domain, error = %e, "failed to restore route");
            }
        }
        let restored = async {
            self.proxy.regenerate_config().await?;
            if self.proxy.validate_config().await? {
                self.proxy.reload().await?;
            }
            DeployResult::Ok(())
        }
        .await;
        if let Err(e) = restored {
            tracing::warn!(app, error = %e, "proxy rollback incomplete");
        }
    }

    async fn persist(&self, run: &Run<'_>, port: u16, workspace: &Path) -> DeployResult<AppRecord> {
        let job = run.job;
        let now = Utc::now();
        let record = AppRecord {
            name: job.app_name.clone(),
            source: job.source.clone(),
            runtime: job.runtime.clone(),
            port,
            workspace: workspace.to_path_buf(),
            created_at: run.previous.as_ref().map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store.save_app(&record).await?;
        Ok(record)
    }
}
