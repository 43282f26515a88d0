//! In-process supervisor for hosts without systemd (and for tests).

use std::{
    collections::{HashMap, VecDeque},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};

use super::{ServiceSpec, ServiceState, ServiceSupervisor};
use crate::error::{DeployError, DeployResult};

const LOG_MAX_LINES: usize = 1000;
/// A run this long resets the restart budget.
const HEALTHY_RUNTIME: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug)]
pub struct RestartConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

fn compute_backoff_ms(cfg: RestartConfig, attempt: u32) -> u64 {
    // attempt is 1-based.
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
    cfg.backoff_ms.saturating_mul(mult).min(cfg.backoff_max_ms)
}

struct Instance {
    spec: ServiceSpec,
    state: ServiceState,
    pgid: Option<i32>,
    /// Bumped on every spawn; a watcher only acts on its own generation.
    generation: u64,
    stopping: bool,
    restart_attempts: u32,
    logs: VecDeque<String>,
}

impl Instance {
    fn push_log(&mut self, line: String) {
        self.logs.push_back(line);
        while self.logs.len() > LOG_MAX_LINES {
            self.logs.pop_front();
        }
    }
}

struct Shared {
    services: Mutex<HashMap<String, Instance>>,
    restart: RestartConfig,
    grace: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instance>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct LocalSupervisor {
    shared: Arc<Shared>,
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::new(RestartConfig::default(), Duration::from_secs(5))
    }
}

impl LocalSupervisor {
    pub fn new(restart: RestartConfig, grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                services: Mutex::new(HashMap::new()),
                restart,
                grace,
            }),
        }
    }

    /// Most recent output lines of a service, oldest first.
    pub fn tail_logs(&self, app_name: &str, limit: usize) -> Vec<String> {
        let services = self.shared.lock();
        let Some(inst) = services.get(app_name) else {
            return Vec::new();
        };
        let skip = inst.logs.len().saturating_sub(limit);
        inst.logs.iter().skip(skip).cloned().collect()
    }

    async fn stop_instance(&self, app_name: &str) {
        let pgid = {
            let mut services = self.shared.lock();
            let Some(inst) = services.get_mut(app_name) else {
                return;
            };
            if inst.state != ServiceState::Running {
                return;
            }
            inst.stopping = true;
            inst.push_log("[shipyard] stop requested".to_string());
            inst.pgid
        };

        let Some(pgid) = pgid else {
            return;
        };
        signal_group(pgid, Signal::Term);

        let deadline = tokio::time::Instant::now() + self.shared.grace;
        loop {
            if !self.is_running(app_name) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        signal_group(pgid, Signal::Kill);
        if let Some(inst) = self.shared.lock().get_mut(app_name) {
            inst.push_log("[shipyard] stop: sent SIGKILL (timeout)".to_string());
        }
        for _ in 0..20 {
            if !self.is_running(app_name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::warn!(app = app_name, "service did not exit after SIGKILL");
    }

    fn is_running(&self, app_name: &str) -> bool {
        self.shared
            .lock()
            .get(app_name)
            .is_some_and(|i| i.state == ServiceState::Running)
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: Signal) {}

fn spawn_instance(shared: &Arc<Shared>, app_name: &str) -> DeployResult<()> {
    let mut services = shared.lock();
    let inst = services
        .get_mut(app_name)
        .ok_or_else(|| DeployError::not_found("service", app_name))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&inst.spec.start_command)
        .current_dir(&inst.spec.cwd)
        .envs(&inst.spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        DeployError::Registration(format!(
            "spawn `{}` in {}: {e}",
            inst.spec.start_command,
            inst.spec.cwd.display()
        ))
    })?;

    inst.generation = inst.generation.wrapping_add(1);
    inst.state = ServiceState::Running;
    inst.stopping = false;
    inst.pgid = child.id().map(|p| p as i32);
    let generation = inst.generation;
    inst.push_log(format!(
        "[shipyard] started pid={}",
        child.id().unwrap_or_default()
    ));
    drop(services);

    if let Some(out) = child.stdout.take() {
        tokio::spawn(collect_output(shared.clone(), app_name.to_string(), out));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(collect_output(shared.clone(), app_name.to_string(), err));
    }
    tokio::spawn(watch(shared.clone(), app_name.to_string(), generation, child));
    Ok(())
}

async fn collect_output<R>(shared: Arc<Shared>, app_name: String, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(inst) = shared.lock().get_mut(&app_name) {
            inst.push_log(line);
        }
    }
}

async fn watch(shared: Arc<Shared>, app_name: String, generation: u64, mut child: Child) {
    let started = tokio::time::Instant::now();
    let res = child.wait().await;
    let runtime = started.elapsed();

    let restart_after = {
        let mut services = shared.lock();
        let Some(inst) = services.get_mut(&app_name) else {
            return;
        };
        if inst.generation != generation {
            return;
        }
        inst.pgid = None;

        let exit = match &res {
            Ok(status) => format!("{:?}", status.code()),
            Err(e) => format!("wait failed: {e}"),
        };
        inst.push_log(format!(
            "[shipyard] process exited: exit_code={exit} runtime_ms={}",
            runtime.as_millis()
        ));

        if inst.stopping {
            inst.state = ServiceState::Stopped;
            inst.stopping = false;
            None
        } else {
            let failed = !matches!(&res, Ok(status) if status.success());
            inst.state = if failed {
                ServiceState::Failed
            } else {
                ServiceState::Stopped
            };
            if runtime >= HEALTHY_RUNTIME {
                inst.restart_attempts = 0;
            }
            if failed && inst.restart_attempts < shared.restart.max_retries {
                inst.restart_attempts += 1;
                let delay = compute_backoff_ms(shared.restart, inst.restart_attempts);
                inst.push_log(format!(
                    "[shipyard] restarting in {delay}ms (attempt {}/{})",
                    inst.restart_attempts, shared.restart.max_retries
                ));
                Some(Duration::from_millis(delay))
            } else {
                None
            }
        }
    };

    let Some(delay) = restart_after else {
        return;
    };
    tokio::time::sleep(delay).await;

    // A stop, start or removal during the backoff wins over the restart.
    let still_current = shared
        .lock()
        .get(&app_name)
        .is_some_and(|i| i.generation == generation && i.state == ServiceState::Failed);
    if still_current && let Err(err) = spawn_instance(&shared, &app_name) {
        tracing::warn!(app = %app_name, error = %err, "service restart failed");
    }
}

#[async_trait]
impl ServiceSupervisor for LocalSupervisor {
    async fn register_service(&self, spec: &ServiceSpec) -> DeployResult<()> {
        let mut services = self.shared.lock();
        match services.get_mut(&spec.app_name) {
            Some(inst) => inst.spec = spec.clone(),
            None => {
                services.insert(
                    spec.app_name.clone(),
                    Instance {
                        spec: spec.clone(),
                        state: ServiceState::Stopped,
                        pgid: None,
                        generation: 0,
                        stopping: false,
                        restart_attempts: 0,
                        logs: VecDeque::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn start_service(&self, app_name: &str) -> DeployResult<()> {
        self.stop_instance(app_name).await;
        {
            let mut services = self.shared.lock();
            let inst = services
                .get_mut(app_name)
                .ok_or_else(|| DeployError::not_found("service", app_name))?;
            inst.restart_attempts = 0;
            // Invalidate any restart scheduled by the previous run.
            inst.generation = inst.generation.wrapping_add(1);
        }
        spawn_instance(&self.shared, app_name)?;
        tracing::info!(app = app_name, "local service started");
        Ok(())
    }

    async fn stop_service(&self, app_name: &str) -> DeployResult<()> {
        self.stop_instance(app_name).await;
        if let Some(inst) = self.shared.lock().get_mut(app_name) {
            inst.generation = inst.generation.wrapping_add(1);
            if inst.state == ServiceState::Failed {
                inst.state = ServiceState::Stopped;
            }
        }
        Ok(())
    }

    async fn remove_service(&self, app_name: &str) -> DeployResult<()> {
        self.stop_service(app_name).await?;
        self.shared.lock().remove(app_name);
        Ok(())
    }

    async fn service_status(&self, app_name: &str) -> DeployResult<ServiceState> {
        Ok(self
            .shared
            .lock()
            .get(app_name)
            .map(|i| i.state)
            .unwrap_or(ServiceState::Missing))
    }

    async fn service_logs(&self, app_name: &str, lines: usize) -> DeployResult<Vec<String>> {
        Ok(self.tail_logs(app_name, lines))
    }
}
