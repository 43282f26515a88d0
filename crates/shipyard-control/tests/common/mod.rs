#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use shipyard_control::broker::{LogBroker, LogSink};
use shipyard_control::error::{DeployError, DeployResult};
use shipyard_control::lifecycle::Lifecycle;
use shipyard_control::pipeline::Pipeline;
use shipyard_control::proxy::{ReverseProxy, Route};
use shipyard_control::queue::{DeployRequest, QueueManager, RequestSource};
use shipyard_control::source::{SourceFetcher, extract_flattened};
use shipyard_control::store::{MemoryStore, Store};
use shipyard_control::supervisor::{ServiceSpec, ServiceState, ServiceSupervisor};
use shipyard_control::workspace::{UploadStore, Workspaces};
use shipyard_job::{
    DeployMode, DomainRecord, DomainSpec, Job, JobId, JobStatus, Runtime, RuntimeSpec,
};

/// Writes a tiny project instead of cloning.
pub struct FakeFetcher;

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn clone_or_checkout(
        &self,
        repository: &str,
        branch: &str,
        dest: &Path,
        log: &LogSink,
    ) -> DeployResult<()> {
        if repository.contains("missing") {
            return Err(DeployError::Fetch(format!("repository not found: {repository}")));
        }
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("README"), format!("{repository}@{branch}\n")).await?;
        log.line(format!("cloned {repository} ({branch})"));
        Ok(())
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> DeployResult<()> {
        extract_flattened(archive, dest)
    }
}

#[derive(Default)]
pub struct FakeSupervisor {
    services: Mutex<HashMap<String, (ServiceSpec, ServiceState)>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    pub starts: AtomicUsize,
}

impl FakeSupervisor {
    fn log(&self, app: &str, line: String) {
        self.logs
            .lock()
            .unwrap()
            .entry(app.to_string())
            .or_default()
            .push(line);
    }

    pub fn spec(&self, app: &str) -> Option<ServiceSpec> {
        self.services
            .lock()
            .unwrap()
            .get(app)
            .map(|(spec, _)| spec.clone())
    }
}

#[async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn register_service(&self, spec: &ServiceSpec) -> DeployResult<()> {
        self.services
            .lock()
            .unwrap()
            .insert(spec.app_name.clone(), (spec.clone(), ServiceState::Stopped));
        Ok(())
    }

    async fn start_service(&self, app_name: &str) -> DeployResult<()> {
        let mut services = self.services.lock().unwrap();
        let (_, state) = services
            .get_mut(app_name)
            .ok_or_else(|| DeployError::not_found("service", app_name))?;
        *state = ServiceState::Running;
        drop(services);
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        self.log(app_name, format!("start #{n}"));
        Ok(())
    }

    async fn stop_service(&self, app_name: &str) -> DeployResult<()> {
        if let Some((_, state)) = self.services.lock().unwrap().get_mut(app_name) {
            *state = ServiceState::Stopped;
        }
        self.log(app_name, "stopped".to_string());
        Ok(())
    }

    async fn remove_service(&self, app_name: &str) -> DeployResult<()> {
        self.services.lock().unwrap().remove(app_name);
        self.logs.lock().unwrap().remove(app_name);
        Ok(())
    }

    async fn service_status(&self, app_name: &str) -> DeployResult<ServiceState> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(app_name)
            .map(|(_, state)| *state)
            .unwrap_or(ServiceState::Missing))
    }

    async fn service_logs(&self, app_name: &str, lines: usize) -> DeployResult<Vec<String>> {
        let logs = self.logs.lock().unwrap();
        let all = logs.get(app_name).map(Vec::as_slice).unwrap_or_default();
        Ok(all[all.len().saturating_sub(lines)..].to_vec())
    }
}

/// Keeps routes in the store like the real proxy, but never shells out.
pub struct FakeProxy {
    store: Arc<dyn Store>,
    pub reloads: AtomicUsize,
    /// When set, validation fails and the route change must be rolled back.
    pub reject: Mutex<bool>,
}

impl FakeProxy {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            reloads: AtomicUsize::new(0),
            reject: Mutex::new(false),
        }
    }
}

#[async_trait]
impl ReverseProxy for FakeProxy {
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
        Ok(())
    }

    async fn validate_config(&self) -> DeployResult<bool> {
        Ok(!*self.reject.lock().unwrap())
    }

    async fn reload(&self) -> DeployResult<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub _tmp: tempfile::TempDir,
    pub store: Arc<dyn Store>,
    pub supervisor: Arc<FakeSupervisor>,
    pub proxy: Arc<FakeProxy>,
    pub workspaces: Workspaces,
    pub queue: QueueManager,
    pub lifecycle: Lifecycle,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with_store(Arc::new(MemoryStore::new())).await
    }

    pub async fn start_with_store(store: Arc<dyn Store>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FakeSupervisor::default());
        let proxy = Arc::new(FakeProxy::new(store.clone()));
        let workspaces = Workspaces::new(tmp.path().join("workspaces"));
        let uploads = UploadStore::new(tmp.path().join("uploads"));

        let pipeline = Pipeline {
            store: store.clone(),
            supervisor: supervisor.clone(),
            proxy: proxy.clone(),
            fetcher: Arc::new(FakeFetcher),
            workspaces: workspaces.clone(),
            uploads: uploads.clone(),
            command_timeout: Duration::from_secs(30),
        };
        let queue = QueueManager::start(store.clone(), LogBroker::new(), pipeline, uploads.clone())
            .await
            .unwrap();
        let lifecycle = Lifecycle::new(
            queue.clone(),
            supervisor.clone(),
            proxy.clone(),
            workspaces.clone(),
            uploads,
        );

        Self {
            _tmp: tmp,
            store,
            supervisor,
            proxy,
            workspaces,
            queue,
            lifecycle,
        }
    }

    /// Poll until the job is terminal and the queue has released it.
    pub async fn wait(&self, id: JobId) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let job = self.queue.status(id).await.unwrap();
            if job.status.is_terminal() && !self.queue.has_active_job(&job.app_name) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} still {:?}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn git_request(app: &str, install: &str) -> DeployRequest {
    DeployRequest {
        app_name: app.to_string(),
        mode: DeployMode::Create,
        source: RequestSource::Git {
            repository: format!("https://git.example.com/{app}.git"),
            branch: "main".to_string(),
        },
        runtime: RuntimeSpec {
            runtime: Runtime::Node,
            install_command: install.to_string(),
            build_command: None,
            start_command: "node server.js".to_string(),
            env: BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]),
        },
        domains: Vec::new(),
    }
}

pub fn with_domain(mut req: DeployRequest, domain: &str) -> DeployRequest {
    req.domains.push(DomainSpec {
        domain: domain.to_string(),
        tls: false,
    });
    req
}

pub fn assert_completed(job: &Job) {
    assert_eq!(
        job.status,
        JobStatus::Completed,
        "job failed: {:?}\n{}",
        job.error_message,
        job.logs
    );
}
