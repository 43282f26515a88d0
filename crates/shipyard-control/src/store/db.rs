use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, sea_query::OnConflict,
};
use shipyard_db::entities::{app_domains, apps, deploy_jobs};
use shipyard_job::{
    AppRecord, DomainRecord, DomainSpec, Job, JobId, JobStatus, RuntimeSpec, Source, SourceKind,
};

use super::{JobUpdate, Store, check_transition};
use crate::error::{DeployError, DeployResult};

/// Store backed by sea-orm (PostgreSQL or SQLite).
#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> DeployError {
    DeployError::Store(DbErr::Custom(format!("corrupt {what}: {detail}")))
}

fn parse<T>(what: &str, raw: &str) -> DeployResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| corrupt(what, e))
}

fn to_port(raw: i32) -> DeployResult<u16> {
    u16::try_from(raw).map_err(|_| corrupt("port", raw))
}

struct SourceColumns {
    kind: String,
    repository: Option<String>,
    branch: Option<String>,
    upload_ref: Option<String>,
}

fn source_columns(source: &Source) -> SourceColumns {
    match source {
        Source::Git { repository, branch } => SourceColumns {
            kind: SourceKind::Git.to_string(),
            repository: Some(repository.clone()),
            branch: Some(branch.clone()),
            upload_ref: None,
        },
        Source::File { upload } => SourceColumns {
            kind: SourceKind::File.to_string(),
            repository: None,
            branch: None,
            upload_ref: Some(upload.clone()),
        },
    }
}

fn source_from_columns(
    kind: &str,
    repository: Option<String>,
    branch: Option<String>,
    upload_ref: Option<String>,
) -> DeployResult<Source> {
    match parse::<SourceKind>("source kind", kind)? {
        SourceKind::Git => Ok(Source::Git {
            repository: repository.ok_or_else(|| corrupt("git source", "missing repository"))?,
            branch: branch.ok_or_else(|| corrupt("git source", "missing branch"))?,
        }),
        SourceKind::File => Ok(Source::File {
            upload: upload_ref.ok_or_else(|| corrupt("file source", "missing upload"))?,
        }),
    }
}

fn env_json(env: &BTreeMap<String, String>) -> DeployResult<String> {
    serde_json::to_string(env).map_err(|e| corrupt("env", e))
}

fn runtime_spec(
    runtime: &str,
    install_command: String,
    build_command: Option<String>,
    start_command: String,
    env_json: &str,
) -> DeployResult<RuntimeSpec> {
    Ok(RuntimeSpec {
        runtime: parse("runtime", runtime)?,
        install_command,
        build_command,
        start_command,
        env: serde_json::from_str(env_json).map_err(|e| corrupt("env", e))?,
    })
}

fn app_from_model(m: apps::Model) -> DeployResult<AppRecord> {
    Ok(AppRecord {
        source: source_from_columns(&m.source_kind, m.repository, m.branch, m.upload_ref)?,
        runtime: runtime_spec(
            &m.runtime,
            m.install_command,
            m.build_command,
            m.start_command,
            &m.env_json,
        )?,
        port: to_port(m.port)?,
        workspace: PathBuf::from(m.workspace),
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
        name: m.name,
    })
}

fn job_from_model(m: deploy_jobs::Model) -> DeployResult<Job> {
    Ok(Job {
        id: JobId(m.id),
        mode: parse("mode", &m.mode)?,
        source: source_from_columns(&m.source_kind, m.repository, m.branch, m.upload_ref)?,
        runtime: runtime_spec(
            &m.runtime,
            m.install_command,
            m.build_command,
            m.start_command,
            &m.env_json,
        )?,
        domains: serde_json::from_str(&m.domains_json).map_err(|e| corrupt("domains", e))?,
        status: parse("status", &m.status)?,
        stage: m.stage.as_deref().map(|s| parse("stage", s)).transpose()?,
        logs: m.logs,
        created_at: m.created_at.with_timezone(&Utc),
        started_at: m.started_at.map(|t| t.with_timezone(&Utc)),
        completed_at: m.completed_at.map(|t| t.with_timezone(&Utc)),
        error_message: m.error_message,
        app_name: m.app_name,
    })
}

fn domain_from_model(m: app_domains::Model) -> DeployResult<DomainRecord> {
    Ok(DomainRecord {
        id: m.id,
        app_name: m.app_name,
        domain: m.domain,
        tls: m.tls_enabled,
        upstream_port: to_port(m.upstream_port)?,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn save_app(&self, app: &AppRecord) -> DeployResult<()> {
        let src = source_columns(&app.source);
        let model = apps::ActiveModel {
            name: Set(app.name.clone()),
            source_kind: Set(src.kind),
            repository: Set(src.repository),
            branch: Set(src.branch),
            upload_ref: Set(src.upload_ref),
            runtime: Set(app.runtime.runtime.to_string()),
            install_command: Set(app.runtime.install_command.clone()),
            build_command: Set(app.runtime.build_command.clone()),
            start_command: Set(app.runtime.start_command.clone()),
            env_json: Set(env_json(&app.runtime.env)?),
            port: Set(i32::from(app.port)),
            workspace: Set(app.workspace.to_string_lossy().into_owned()),
            created_at: Set(app.created_at.into()),
            updated_at: Set(app.updated_at.into()),
        };

        apps::Entity::insert(model)
            .on_conflict(
                OnConflict::column(apps::Column::Name)
                    .update_columns([
                        apps::Column::SourceKind,
                        apps::Column::Repository,
                        apps::Column::Branch,
                        apps::Column::UploadRef,
                        apps::Column::Runtime,
                        apps::Column::InstallCommand,
                        apps::Column::BuildCommand,
                        apps::Column::StartCommand,
                        apps::Column::EnvJson,
                        apps::Column::Port,
                        apps::Column::Workspace,
                        apps::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_app(&self, name: &str) -> DeployResult<Option<AppRecord>> {
        apps::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await?
            .map(app_from_model)
            .transpose()
    }

    async fn delete_app(&self, name: &str) -> DeployResult<bool> {
        let res = apps::Entity::delete_by_id(name.to_string())
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    async fn list_apps(&self) -> DeployResult<Vec<AppRecord>> {
        apps::Entity::find()
            .order_by_asc(apps::Column::Name)
            .all(&self.db)
            .await?
            .into_iter()
            .map(app_from_model)
            .collect()
    }

    async fn save_job(&self, job: &Job) -> DeployResult<()> {
        let src = source_columns(&job.source);
        let model = deploy_jobs::ActiveModel {
            id: Set(job.id.0),
            app_name: Set(job.app_name.clone()),
            mode: Set(job.mode.to_string()),
            source_kind: Set(src.kind),
            repository: Set(src.repository),
            branch: Set(src.branch),
            upload_ref: Set(src.upload_ref),
            runtime: Set(job.runtime.runtime.to_string()),
            install_command: Set(job.runtime.install_command.clone()),
            build_command: Set(job.runtime.build_command.clone()),
            start_command: Set(job.runtime.start_command.clone()),
            env_json: Set(env_json(&job.runtime.env)?),
            domains_json: Set(
                serde_json::to_string(&job.domains).map_err(|e| corrupt("domains", e))?
            ),
            status: Set(job.status.to_string()),
            stage: Set(job.stage.map(|s| s.to_string())),
            logs: Set(job.logs.clone()),
            error_message: Set(job.error_message.clone()),
            created_at: Set(job.created_at.into()),
            started_at: Set(job.started_at.map(Into::into)),
            completed_at: Set(job.completed_at.map(Into::into)),
        };

        deploy_jobs::Entity::insert(model)
            .on_conflict(
                OnConflict::column(deploy_jobs::Column::Id)
                    .update_columns([
                        deploy_jobs::Column::Status,
                        deploy_jobs::Column::Stage,
                        deploy_jobs::Column::Logs,
                        deploy_jobs::Column::ErrorMessage,
                        deploy_jobs::Column::StartedAt,
                        deploy_jobs::Column::CompletedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: JobUpdate,
    ) -> DeployResult<()> {
        let model = deploy_jobs::Entity::find_by_id(id.0)
            .one(&self.db)
            .await?
            .ok_or_else(|| DeployError::not_found("job", id))?;
        check_transition(id, parse("status", &model.status)?, status)?;

        let mut active: deploy_jobs::ActiveModel = model.into();
        active.status = Set(status.to_string());
        if let Some(stage) = update.stage {
            active.stage = Set(Some(stage.to_string()));
        }
        if let Some(logs) = update.logs {
            active.logs = Set(logs);
        }
        if let Some(at) = update.started_at {
            active.started_at = Set(Some(at.into()));
        }
        if let Some(at) = update.completed_at {
            active.completed_at = Set(Some(at.into()));
        }
        if let Some(msg) = update.error_message {
            active.error_message = Set(Some(msg));
        }
        active.update(&self.db).await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> DeployResult<Option<Job>> {
        deploy_jobs::Entity::find_by_id(id.0)
            .one(&self.db)
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn list_jobs(&self) -> DeployResult<Vec<Job>> {
        deploy_jobs::Entity::find()
            .order_by_asc(deploy_jobs::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    async fn jobs_for_app(&self, app: &str, limit: usize) -> DeployResult<Vec<Job>> {
        deploy_jobs::Entity::find()
            .filter(deploy_jobs::Column::AppName.eq(app))
            .order_by_desc(deploy_jobs::Column::Id)
            .limit(limit as u64)
            .all(&self.db)
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    async fn save_domain(
        &self,
        app: &str,
        domain: &DomainSpec,
        upstream_port: u16,
    ) -> DeployResult<DomainRecord> {
        let existing = app_domains::Entity::find()
            .filter(app_domains::Column::Domain.eq(domain.domain.as_str()))
            .one(&self.db)
            .await?;

        let model = match existing {
            Some(row) if row.app_name != app => {
                return Err(DeployError::Registration(format!(
                    "domain {} is already routed to {}",
                    domain.domain, row.app_name
                )));
            }
            Some(row) => {
                let mut active: app_domains::ActiveModel = row.into();
                active.tls_enabled = Set(domain.tls);
                active.upstream_port = Set(i32::from(upstream_port));
                active.update(&self.db).await?
            }
            None => {
                app_domains::ActiveModel {
                    app_name: Set(app.to_string()),
                    domain: Set(domain.domain.clone()),
                    tls_enabled: Set(domain.tls),
                    upstream_port: Set(i32::from(upstream_port)),
                    created_at: Set(Utc::now().into()),
                    ..Default::default()
                }
                .insert(&self.db)
                .await?
            }
        };
        domain_from_model(model)
    }

    async fn delete_domain(&self, id: i64) -> DeployResult<bool> {
        let res = app_domains::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(res.rows_affected > 0)
    }

    async fn domains_for_app(&self, app: &str) -> DeployResult<Vec<DomainRecord>> {
        app_domains::Entity::find()
            .filter(app_domains::Column::AppName.eq(app))
            .order_by_asc(app_domains::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(domain_from_model)
            .collect()
    }

    async fn list_domains(&self) -> DeployResult<Vec<DomainRecord>> {
        app_domains::Entity::find()
            .order_by_asc(app_domains::Column::Domain)
            .all(&self.db)
            .await?
            .into_iter()
            .map(domain_from_model)
            .collect()
    }
}
