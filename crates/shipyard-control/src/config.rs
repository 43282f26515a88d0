use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_DATA_ROOT: &str = "/var/lib/shipyard";
const DEFAULT_DATABASE_URL: &str = "sqlite:///var/lib/shipyard/shipyard.db?mode=rwc";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024; // 512 MiB

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_flag(name: &str) -> bool {
    matches!(
        env_string(name)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorKind {
    Systemd,
    Local,
}

fn parse_supervisor(raw: Option<String>) -> SupervisorKind {
    match raw
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "local" | "inprocess" | "in-process" => SupervisorKind::Local,
        _ => SupervisorKind::Systemd,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub data_root: PathBuf,
    pub database_url: String,
    pub supervisor: SupervisorKind,
    pub systemd_unit_dir: PathBuf,
    pub caddyfile: PathBuf,
    pub caddy_bin: String,
    pub api_token: Option<String>,
    pub read_only: bool,
    pub command_timeout: Duration,
    pub max_upload_bytes: u64,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen = env_string("SHIPYARD_LISTEN")
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid SHIPYARD_LISTEN: {e}"))?;

        let data_root = env_string("SHIPYARD_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));

        let command_timeout = Duration::from_secs(
            env_u64("SHIPYARD_COMMAND_TIMEOUT_SECS")
                .map(|v| v.clamp(10, 24 * 60 * 60))
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        );

        let max_upload_bytes = env_u64("SHIPYARD_MAX_UPLOAD_BYTES")
            .map(|v| v.clamp(1024 * 1024, 8 * 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        Ok(Self {
            listen,
            database_url: env_string("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            supervisor: parse_supervisor(env_string("SHIPYARD_SUPERVISOR")),
            systemd_unit_dir: env_string("SHIPYARD_SYSTEMD_UNIT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/etc/systemd/system")),
            caddyfile: env_string("SHIPYARD_CADDYFILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_root.join("Caddyfile")),
            caddy_bin: env_string("SHIPYARD_CADDY_BIN").unwrap_or_else(|| "caddy".to_string()),
            api_token: env_string("SHIPYARD_API_TOKEN"),
            read_only: env_flag("SHIPYARD_READ_ONLY"),
            command_timeout,
            max_upload_bytes,
            log_dir: env_string("SHIPYARD_LOG_DIR").map(PathBuf::from),
            data_root,
        })
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_root.join("workspaces")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_root.join("uploads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_defaults_to_systemd() {
        assert_eq!(parse_supervisor(None), SupervisorKind::Systemd);
        assert_eq!(parse_supervisor(Some("bogus".into())), SupervisorKind::Systemd);
        assert_eq!(parse_supervisor(Some(" Local ".into())), SupervisorKind::Local);
    }
}
