mod common;

use std::{
    io::Write,
    sync::Arc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use shipyard_control::error::{DeployError, DeployResult};
use shipyard_control::queue::RequestSource;
use shipyard_control::store::{JobUpdate, MemoryStore, SeaOrmStore, Store};
use shipyard_control::supervisor::ServiceState;
use shipyard_job::{
    AppRecord, AppState, DeployMode, DomainRecord, DomainSpec, Job, JobId, JobStatus, Source,
    Stage,
};

use common::{Harness, assert_completed, git_request, with_domain};

/// Memory store whose next `domains_for_app` can be made to stall.
#[derive(Default)]
struct StallingStore {
    inner: MemoryStore,
    stall_next_domains: AtomicBool,
}

#[async_trait]
impl Store for StallingStore {
    async fn save_app(&self, app: &AppRecord) -> DeployResult<()> {
        self.inner.save_app(app).await
    }

    async fn get_app(&self, name: &str) -> DeployResult<Option<AppRecord>> {
        self.inner.get_app(name).await
    }

    async fn delete_app(&self, name: &str) -> DeployResult<bool> {
        self.inner.delete_app(name).await
    }

    async fn list_apps(&self) -> DeployResult<Vec<AppRecord>> {
        self.inner.list_apps().await
    }

    async fn save_job(&self, job: &Job) -> DeployResult<()> {
        self.inner.save_job(job).await
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        update: JobUpdate,
    ) -> DeployResult<()> {
        self.inner.update_job_status(id, status, update).await
    }

    async fn get_job(&self, id: JobId) -> DeployResult<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> DeployResult<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn jobs_for_app(&self, app: &str, limit: usize) -> DeployResult<Vec<Job>> {
        self.inner.jobs_for_app(app, limit).await
    }

    async fn save_domain(
        &self,
        app: &str,
        domain: &DomainSpec,
        upstream_port: u16,
    ) -> DeployResult<DomainRecord> {
        self.inner.save_domain(app, domain, upstream_port).await
    }

    async fn delete_domain(&self, id: i64) -> DeployResult<bool> {
        self.inner.delete_domain(id).await
    }

    async fn domains_for_app(&self, app: &str) -> DeployResult<Vec<DomainRecord>> {
        if self.stall_next_domains.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.domains_for_app(app).await
    }

    async fn list_domains(&self) -> DeployResult<Vec<DomainRecord>> {
        self.inner.list_domains().await
    }
}

fn domain_names(records: &[DomainRecord]) -> Vec<String> {
    let mut names: Vec<String> = records.iter().map(|d| d.domain.clone()).collect();
    names.sort();
    names
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf.into_inner()
}

#[tokio::test]
async fn redeploy_of_unknown_app_is_not_found() {
    let h = Harness::start().await;
    let err = h.lifecycle.redeploy("ghost").await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound { what: "app", .. }));
    assert!(h.queue.list_all().await.unwrap().is_empty());
    assert_eq!(h.lifecycle.app_state("ghost").await.unwrap(), AppState::Absent);
}

#[tokio::test]
async fn redeploy_reuses_port_and_replaces_workspace() {
    let h = Harness::start().await;
    let id = h
        .queue
        .enqueue(with_domain(git_request("api", "true"), "api.example.com"))
        .await
        .unwrap();
    assert_completed(&h.wait(id).await);
    let before = h.store.get_app("api").await.unwrap().unwrap();
    let reloads = h.proxy.reloads.load(Ordering::SeqCst);

    let again = h.lifecycle.redeploy("api").await.unwrap();
    let job = h.wait(again).await;
    assert_completed(&job);
    assert_eq!(job.mode, DeployMode::Redeploy);

    let after = h.store.get_app("api").await.unwrap().unwrap();
    assert_eq!(after.port, before.port);
    assert_eq!(after.created_at, before.created_at);
    assert_ne!(after.workspace, before.workspace);
    assert!(!before.workspace.exists());
    assert!(after.workspace.exists());

    // Same domain set, so the proxy is left alone.
    assert_eq!(h.proxy.reloads.load(Ordering::SeqCst), reloads);
    assert_eq!(h.store.domains_for_app("api").await.unwrap().len(), 1);
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 2);
    assert_eq!(h.lifecycle.app_state("api").await.unwrap(), AppState::Running);
}

#[tokio::test]
async fn delete_tears_everything_down_and_is_repeatable() {
    let h = Harness::start().await;
    let id = h
        .queue
        .enqueue(with_domain(git_request("gone", "true"), "gone.example.com"))
        .await
        .unwrap();
    assert_completed(&h.wait(id).await);
    assert_eq!(
        h.supervisor.spec("gone").map(|s| s.app_name),
        Some("gone".to_string())
    );

    h.lifecycle.delete("gone").await.unwrap();
    assert!(h.store.get_app("gone").await.unwrap().is_none());
    assert!(h.store.domains_for_app("gone").await.unwrap().is_empty());
    assert!(h.supervisor.spec("gone").is_none());
    assert!(!h.workspaces.app_dir("gone").exists());

    h.lifecycle.delete("gone").await.unwrap();
    h.lifecycle.delete("never-existed").await.unwrap();

    // Jobs stay as history.
    assert_eq!(h.queue.history("gone", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_is_refused_while_a_job_is_in_flight() {
    let h = Harness::start().await;
    let id = h.queue.enqueue(git_request("busy", "sleep 0.3")).await.unwrap();
    assert_eq!(
        h.lifecycle.app_state("busy").await.unwrap(),
        AppState::Provisioning
    );
    assert!(matches!(
        h.lifecycle.delete("busy").await,
        Err(DeployError::Validation { .. })
    ));
    assert_completed(&h.wait(id).await);
    h.lifecycle.delete("busy").await.unwrap();
}

#[tokio::test]
async fn redeploy_racing_a_delete_finds_no_app() {
    let store = Arc::new(StallingStore::default());
    let h = Harness::start_with_store(store.clone()).await;
    let id = h
        .queue
        .enqueue(with_domain(git_request("x", "true"), "x.example.com"))
        .await
        .unwrap();
    assert_completed(&h.wait(id).await);

    store.stall_next_domains.store(true, Ordering::SeqCst);
    let deleting = {
        let lifecycle = h.lifecycle.clone();
        tokio::spawn(async move { lifecycle.delete("x").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.lifecycle.redeploy("x").await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound { what: "app", .. }), "{err:?}");
    deleting.await.unwrap().unwrap();

    assert!(h.store.get_app("x").await.unwrap().is_none());
    assert!(h.supervisor.spec("x").is_none());
    assert!(h.store.domains_for_app("x").await.unwrap().is_empty());
    assert_eq!(h.queue.list_all().await.unwrap().len(), 1);
    assert!(!h.queue.has_active_job("x"));
}

#[tokio::test]
async fn rejected_proxy_config_rolls_back_first_deploy() {
    let h = Harness::start().await;
    *h.proxy.reject.lock().unwrap() = true;
    let id = h
        .queue
        .enqueue(with_domain(git_request("edge", "true"), "edge.example.com"))
        .await
        .unwrap();
    let job = h.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Some(Stage::Proxy));
    let message = job.error_message.unwrap();
    assert!(message.starts_with("proxy failed"), "{message}");
    assert!(job.logs.contains("restoring previous routes"));

    assert!(h.supervisor.spec("edge").is_none());
    assert!(h.store.domains_for_app("edge").await.unwrap().is_empty());
    assert!(h.store.get_app("edge").await.unwrap().is_none());
    assert_eq!(h.proxy.reloads.load(Ordering::SeqCst), 0);
    assert_eq!(h.lifecycle.app_state("edge").await.unwrap(), AppState::Failed);
}

#[tokio::test]
async fn rejected_domain_change_restores_previous_routes() {
    let h = Harness::start().await;
    let id = h
        .queue
        .enqueue(with_domain(git_request("shop", "true"), "shop.example.com"))
        .await
        .unwrap();
    assert_completed(&h.wait(id).await);
    let before = h.store.get_app("shop").await.unwrap().unwrap();
    let reloads = h.proxy.reloads.load(Ordering::SeqCst);

    *h.proxy.reject.lock().unwrap() = true;
    let changed = h
        .lifecycle
        .set_domains(
            "shop",
            vec![DomainSpec {
                domain: "store.example.com".to_string(),
                tls: true,
            }],
        )
        .await
        .unwrap();
    let job = h.wait(changed).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Some(Stage::Proxy));

    let routes = h.store.domains_for_app("shop").await.unwrap();
    assert_eq!(domain_names(&routes), vec!["shop.example.com"]);
    assert_eq!(routes[0].upstream_port, before.port);
    assert!(!routes[0].tls);
    assert_eq!(h.proxy.reloads.load(Ordering::SeqCst), reloads);

    // The running app survives a failed redeploy.
    assert!(h.supervisor.spec("shop").is_some());
    assert_eq!(h.store.get_app("shop").await.unwrap().unwrap().port, before.port);
}

#[tokio::test]
async fn domains_can_be_added_removed_and_replaced() {
    let h = Harness::start().await;
    let id = h
        .queue
        .enqueue(with_domain(git_request("blog", "true"), "blog.example.com"))
        .await
        .unwrap();
    assert_completed(&h.wait(id).await);

    let added = h
        .lifecycle
        .add_domain(
            "blog",
            DomainSpec {
                domain: "WWW.blog.example.com".to_string(),
                tls: true,
            },
        )
        .await
        .unwrap();
    let job = h.wait(added).await;
    assert_completed(&job);
    assert_eq!(job.mode, DeployMode::Redeploy);
    let routes = h.store.domains_for_app("blog").await.unwrap();
    assert_eq!(
        domain_names(&routes),
        vec!["blog.example.com", "www.blog.example.com"]
    );
    assert!(routes.iter().any(|r| r.domain == "www.blog.example.com" && r.tls));

    let again = h
        .lifecycle
        .add_domain(
            "blog",
            DomainSpec {
                domain: "www.blog.example.com".to_string(),
                tls: true,
            },
        )
        .await;
    assert!(matches!(again, Err(DeployError::Validation { .. })));

    let removed = h
        .lifecycle
        .remove_domain("blog", "blog.example.com")
        .await
        .unwrap();
    assert_completed(&h.wait(removed).await);
    assert_eq!(
        domain_names(&h.store.domains_for_app("blog").await.unwrap()),
        vec!["www.blog.example.com"]
    );

    assert!(matches!(
        h.lifecycle.remove_domain("blog", "nope.example.com").await,
        Err(DeployError::NotFound { what: "domain", .. })
    ));
    assert!(matches!(
        h.lifecycle.remove_domain("ghost", "blog.example.com").await,
        Err(DeployError::NotFound { what: "app", .. })
    ));

    let cleared = h.lifecycle.set_domains("blog", Vec::new()).await.unwrap();
    assert_completed(&h.wait(cleared).await);
    assert!(h.store.domains_for_app("blog").await.unwrap().is_empty());
    assert_eq!(h.lifecycle.app_state("blog").await.unwrap(), AppState::Running);
}

#[tokio::test]
async fn domain_changes_wait_for_the_running_job() {
    let h = Harness::start().await;
    let id = h.queue.enqueue(git_request("queued", "sleep 0.3")).await.unwrap();
    assert_completed(&h.wait(id).await);

    let busy = h.lifecycle.redeploy("queued").await.unwrap();
    let err = h
        .lifecycle
        .add_domain(
            "queued",
            DomainSpec {
                domain: "queued.example.com".to_string(),
                tls: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Validation { .. }));
    assert!(matches!(
        h.lifecycle.restart("queued").await,
        Err(DeployError::Validation { .. })
    ));
    assert_completed(&h.wait(busy).await);
}

#[tokio::test]
async fn service_can_be_stopped_started_and_restarted() {
    let h = Harness::start().await;
    let id = h.queue.enqueue(git_request("svc", "true")).await.unwrap();
    assert_completed(&h.wait(id).await);

    assert_eq!(h.lifecycle.stop("svc").await.unwrap(), ServiceState::Stopped);
    assert_eq!(h.lifecycle.start("svc").await.unwrap(), ServiceState::Running);
    // Already running: nothing to do.
    assert_eq!(h.lifecycle.start("svc").await.unwrap(), ServiceState::Running);
    assert_eq!(h.lifecycle.restart("svc").await.unwrap(), ServiceState::Running);
    assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 3);

    let logs = h.lifecycle.service_logs("svc", 2).await.unwrap();
    assert_eq!(logs, vec!["start #2", "start #3"]);
    assert_eq!(h.lifecycle.service_logs("svc", 0).await.unwrap(), vec!["start #3"]);

    for result in [
        h.lifecycle.start("ghost").await,
        h.lifecycle.stop("ghost").await,
        h.lifecycle.restart("ghost").await,
    ] {
        assert!(matches!(result, Err(DeployError::NotFound { what: "app", .. })));
    }
    assert!(matches!(
        h.lifecycle.service_logs("ghost", 10).await,
        Err(DeployError::NotFound { .. })
    ));
}

#[tokio::test]
async fn app_state_follows_latest_job() {
    let h = Harness::start().await;
    let failed = h.queue.enqueue(git_request("flaky", "false")).await.unwrap();
    assert_eq!(h.wait(failed).await.status, JobStatus::Failed);
    assert_eq!(h.lifecycle.app_state("flaky").await.unwrap(), AppState::Failed);

    let ok = h.queue.enqueue(git_request("flaky", "true")).await.unwrap();
    assert_completed(&h.wait(ok).await);
    let view = h.lifecycle.view("flaky").await.unwrap();
    assert_eq!(view.state, AppState::Running);
    assert_eq!(view.service, ServiceState::Running);
    assert_eq!(view.latest_job, Some(ok));

    assert!(matches!(
        h.lifecycle.view("nobody").await,
        Err(DeployError::NotFound { .. })
    ));
}

#[tokio::test]
async fn archive_deploy_flattens_and_retains_upload_for_redeploy() {
    let h = Harness::start().await;
    let mut req = git_request("zipped", "test -f package.json");
    req.source = RequestSource::Archive(zip_bytes(&[
        ("site/package.json", "{}"),
        ("site/server.js", "console.log('hi')"),
    ]));
    let id = h.queue.enqueue(req).await.unwrap();
    assert_completed(&h.wait(id).await);

    let record = h.store.get_app("zipped").await.unwrap().unwrap();
    assert!(record.workspace.join("server.js").exists());
    assert!(matches!(record.source, Source::File { .. }));

    let again = h.lifecycle.redeploy("zipped").await.unwrap();
    assert_completed(&h.wait(again).await);
}

#[tokio::test]
async fn restart_recovery_fails_building_jobs_and_requeues_queued_ones() {
    let db = shipyard_db::connect("sqlite::memory:").await.unwrap();
    {
        use sea_orm_migration::MigratorTrait;
        shipyard_migration::Migrator::up(&db, None).await.unwrap();
    }
    let store: Arc<dyn Store> = Arc::new(SeaOrmStore::new(db));

    // Jobs left behind by a control plane that died mid-build.
    let mut interrupted = Job {
        id: JobId(1),
        app_name: "crashed".to_string(),
        mode: DeployMode::Create,
        source: Source::Git {
            repository: "https://git.example.com/crashed.git".to_string(),
            branch: "main".to_string(),
        },
        runtime: git_request("crashed", "true").runtime,
        domains: Vec::new(),
        status: JobStatus::Building,
        stage: Some(Stage::Install),
        logs: String::new(),
        created_at: chrono::Utc::now(),
        started_at: Some(chrono::Utc::now()),
        completed_at: None,
        error_message: None,
    };
    store.save_job(&interrupted).await.unwrap();
    interrupted.id = JobId(2);
    interrupted.app_name = "waiting".to_string();
    interrupted.status = JobStatus::Queued;
    interrupted.stage = None;
    interrupted.started_at = None;
    store.save_job(&interrupted).await.unwrap();

    let h = Harness::start_with_store(store).await;
    let crashed = h.queue.status(JobId(1)).await.unwrap();
    assert_eq!(crashed.status, JobStatus::Failed);
    assert_eq!(
        crashed.error_message.as_deref(),
        Some("install failed: interrupted by control-plane restart")
    );

    assert_completed(&h.wait(JobId(2)).await);
    let next = h.queue.enqueue(git_request("fresh", "true")).await.unwrap();
    assert_eq!(next, JobId(3));
}
