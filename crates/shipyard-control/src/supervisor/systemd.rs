use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use super::{ServiceSpec, ServiceState, ServiceSupervisor, service_name};
use crate::error::{DeployError, DeployResult};

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs apps as systemd units written into `unit_dir`.
pub struct SystemdSupervisor {
    unit_dir: PathBuf,
    systemctl: String,
    journalctl: String,
}

impl SystemdSupervisor {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            systemctl: "systemctl".to_string(),
            journalctl: "journalctl".to_string(),
        }
    }

    fn unit(app_name: &str) -> String {
        format!("{}.service", service_name(app_name))
    }

    fn unit_path(&self, app_name: &str) -> PathBuf {
        self.unit_dir.join(Self::unit(app_name))
    }

    async fn unit_exists(&self, app_name: &str) -> bool {
        tokio::fs::metadata(self.unit_path(app_name)).await.is_ok()
    }

    async fn systemctl(&self, args: &[&str]) -> DeployResult<std::process::Output> {
        run_tool(&self.systemctl, args).await
    }

    async fn systemctl_ok(&self, args: &[&str]) -> DeployResult<()> {
        let out = self.systemctl(args).await?;
        if !out.status.success() {
            return Err(DeployError::Registration(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

async fn run_tool(bin: &str, args: &[&str]) -> DeployResult<std::process::Output> {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let out = tokio::time::timeout(TOOL_TIMEOUT, cmd.output())
        .await
        .map_err(|_| {
            DeployError::Registration(format!("{bin} {} timed out", args.join(" ")))
        })??;
    Ok(out)
}

/// Escape a value for a double-quoted systemd unit setting.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '%' => out.push_str("%%"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub(crate) fn render_unit(spec: &ServiceSpec) -> String {
    // `$` would be expanded by systemd before the shell sees it.
    let exec = spec.start_command.replace('$', "$$");
    let mut unit = String::new();
    unit.push_str("[Unit]\n");
    unit.push_str(&format!("Description=shipyard app {}\n", spec.app_name));
    unit.push_str("After=network.target\n\n");
    unit.push_str("[Service]\n");
    unit.push_str("Type=simple\n");
    unit.push_str(&format!(
        "WorkingDirectory={}\n",
        quote(&spec.cwd.to_string_lossy())
    ));
    for (k, v) in &spec.env {
        unit.push_str(&format!("Environment={}\n", quote(&format!("{k}={v}"))));
    }
    unit.push_str(&format!("ExecStart=/bin/sh -c {}\n", quote(&exec)));
    unit.push_str("Restart=on-failure\n");
    unit.push_str("RestartSec=3\n");
    unit.push_str("KillMode=control-group\n\n");
    unit.push_str("[Install]\n");
    unit.push_str("WantedBy=multi-user.target\n");
    unit
}

async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("service.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    async fn register_service(&self, spec: &ServiceSpec) -> DeployResult<()> {
        tokio::fs::create_dir_all(&self.unit_dir).await?;
        write_atomic(&self.unit_path(&spec.app_name), &render_unit(spec)).await?;
        self.systemctl_ok(&["daemon-reload"]).await?;
        self.systemctl_ok(&["enable", &Self::unit(&spec.app_name)]).await?;
        tracing::info!(app = %spec.app_name, "systemd unit registered");
        Ok(())
    }

    async fn start_service(&self, app_name: &str) -> DeployResult<()> {
        if !self.unit_exists(app_name).await {
            return Err(DeployError::not_found("service", app_name));
        }
        self.systemctl_ok(&["restart", &Self::unit(app_name)]).await
    }

    async fn stop_service(&self, app_name: &str) -> DeployResult<()> {
        if !self.unit_exists(app_name).await {
            return Ok(());
        }
        self.systemctl_ok(&["stop", &Self::unit(app_name)]).await
    }

    async fn remove_service(&self, app_name: &str) -> DeployResult<()> {
        if !self.unit_exists(app_name).await {
            return Ok(());
        }
        let unit = Self::unit(app_name);
        // A unit that was never enabled still gets removed.
        let _ = self.systemctl(&["disable", "--now", &unit]).await;
        match tokio::fs::remove_file(self.unit_path(app_name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.systemctl_ok(&["daemon-reload"]).await?;
        tracing::info!(app = app_name, "systemd unit removed");
        Ok(())
    }

    async fn service_status(&self, app_name: &str) -> DeployResult<ServiceState> {
        if !self.unit_exists(app_name).await {
            return Ok(ServiceState::Missing);
        }
        let out = self.systemctl(&["is-active", &Self::unit(app_name)]).await?;
        Ok(match String::from_utf8_lossy(&out.stdout).trim() {
            "active" | "activating" | "reloading" => ServiceState::Running,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Stopped,
        })
    }

    async fn service_logs(&self, app_name: &str, lines: usize) -> DeployResult<Vec<String>> {
        if !self.unit_exists(app_name).await {
            return Ok(Vec::new());
        }
        let count = lines.to_string();
        let unit = Self::unit(app_name);
        let args = ["-u", &unit, "-n", &count, "--no-pager", "-o", "cat"];
        let out = run_tool(&self.journalctl, &args).await?;
        if !out.status.success() {
            return Err(DeployError::Registration(format!(
                "journalctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn unit_escapes_shell_and_specifiers() {
        let spec = ServiceSpec {
            app_name: "api".to_string(),
            start_command: "node server.js --greeting \"hi $USER\" 100%".to_string(),
            cwd: PathBuf::from("/srv/shipyard/workspaces/api/job-3"),
            env: BTreeMap::from([("PORT".to_string(), "4100".to_string())]),
        };
        let unit = render_unit(&spec);
        assert!(unit.contains("WorkingDirectory=\"/srv/shipyard/workspaces/api/job-3\"\n"));
        assert!(unit.contains("Environment=\"PORT=4100\"\n"));
        let exec = "ExecStart=/bin/sh -c \"node server.js --greeting \\\"hi $$USER\\\" 100%%\"\n";
        assert!(unit.contains(exec));
    }

    #[tokio::test]
    async fn stop_and_remove_tolerate_missing_units() {
        let dir = tempfile::tempdir().unwrap();
        let sup = SystemdSupervisor::new(dir.path());
        sup.stop_service("ghost").await.unwrap();
        sup.remove_service("ghost").await.unwrap();
        assert!(sup.service_logs("ghost", 10).await.unwrap().is_empty());
        assert_eq!(
            sup.service_status("ghost").await.unwrap(),
            ServiceState::Missing
        );
    }
}
