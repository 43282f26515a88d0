use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};

/// Queue-assigned job identifier. Strictly increasing in enqueue order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

/// Job lifecycle. Transitions only move forward:
/// `Queued -> Building -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Building,
    Completed,
    Failed,
}

string_enum!(JobStatus, "job status", {
    Queued => "queued",
    Building => "building",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Building)
                // Stage and log updates of a running job.
                | (Self::Building, Self::Building)
                | (Self::Building, Self::Completed)
                | (Self::Building, Self::Failed)
                // Recovery path for jobs that never started before a restart.
                | (Self::Queued, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Git,
    File,
}

string_enum!(SourceKind, "source kind", {
    Git => "git",
    File => "file",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
    Bun,
}

string_enum!(Runtime, "runtime", {
    Node => "node",
    Python => "python",
    Bun => "bun",
});

impl Runtime {
    pub fn default_install_command(self) -> &'static str {
        match self {
            Self::Node => "npm install",
            Self::Python => "pip install -r requirements.txt",
            Self::Bun => "bun install",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Create,
    Redeploy,
}

string_enum!(DeployMode, "deploy mode", {
    Create => "create",
    Redeploy => "redeploy",
});

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Install,
    Build,
    Service,
    Proxy,
    Persist,
}

string_enum!(Stage, "stage", {
    Fetch => "fetch",
    Install => "install",
    Build => "build",
    Service => "service",
    Proxy => "proxy",
    Persist => "persist",
});

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Source {
    Git { repository: String, branch: String },
    /// `upload` is an opaque reference handed out by the upload store.
    File { upload: String },
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Git { .. } => SourceKind::Git,
            Self::File { .. } => SourceKind::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeSpec {
    pub runtime: Runtime,
    pub install_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    pub start_command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RuntimeSpec {
    /// The build command, if any non-blank one was given.
    pub fn build_command(&self) -> Option<&str> {
        self.build_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn install_command(&self) -> &str {
        let cmd = self.install_command.trim();
        if cmd.is_empty() {
            self.runtime.default_install_command()
        } else {
            cmd
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DomainSpec {
    pub domain: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub id: JobId,
    pub app_name: String,
    pub mode: DeployMode,
    pub source: Source,
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub domains: Vec<DomainSpec>,
    pub status: JobStatus,
    pub stage: Option<Stage>,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }
}

/// Durable per-app configuration, written when a job completes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub source: Source,
    pub runtime: RuntimeSpec,
    pub port: u16,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DomainRecord {
    pub id: i64,
    pub app_name: String,
    pub domain: String,
    pub tls: bool,
    pub upstream_port: u16,
    pub created_at: DateTime<Utc>,
}

/// Logical state of an application, derived from its record and latest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Absent,
    Provisioning,
    Running,
    Failed,
}

/// Item delivered to log subscribers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    Chunk { text: String },
    End {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_only_move_forward() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Building));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Building));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Building));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Building.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn string_enums_parse_case_insensitively() {
        assert_eq!("Building".parse::<JobStatus>().unwrap(), JobStatus::Building);
        assert_eq!(" bun ".parse::<Runtime>().unwrap(), Runtime::Bun);
        let err = "docker".parse::<Runtime>().unwrap_err();
        assert!(err.to_string().contains("unknown runtime"));
    }

    #[test]
    fn blank_build_command_is_skipped() {
        let spec = RuntimeSpec {
            runtime: Runtime::Node,
            install_command: "  ".to_string(),
            build_command: Some("   ".to_string()),
            start_command: "npm start".to_string(),
            env: BTreeMap::new(),
        };
        assert_eq!(spec.build_command(), None);
        assert_eq!(spec.install_command(), "npm install");
    }

    #[test]
    fn log_event_wire_shape() {
        let end = LogEvent::End {
            status: JobStatus::Failed,
            error_message: Some("install failed".to_string()),
        };
        let v = serde_json::to_value(&end).unwrap();
        assert_eq!(v["type"], "end");
        assert_eq!(v["status"], "failed");
    }
}
