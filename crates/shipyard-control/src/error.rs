use std::{collections::BTreeMap, time::Duration};

use shipyard_job::{JobId, JobStatus, Stage};
use thiserror::Error;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Rejected request; no job is created.
    #[error("{message}")]
    Validation {
        message: String,
        field_errors: BTreeMap<String, String>,
    },

    #[error("{0}")]
    Fetch(String),

    #[error("`{command}` {}", describe_exit(*exit_code))]
    Command {
        command: String,
        exit_code: Option<i32>,
        output_tail: String,
    },

    #[error("`{command}` timed out after {}s", after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("{0}")]
    Registration(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("store: {0}")]
    Store(#[from] sea_orm::DbErr),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exited with code {c}"),
        None => "was terminated by a signal".to_string(),
    }
}

impl DeployError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut field_errors = BTreeMap::new();
        field_errors.insert(field.to_string(), message.clone());
        Self::Validation {
            message,
            field_errors,
        }
    }

    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "invalid_param",
            Self::Fetch(_) => "fetch_failed",
            Self::Command { .. } => "command_failed",
            Self::Timeout { .. } => "timeout",
            Self::Registration(_) => "registration_failed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "store_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// A pipeline failure tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: DeployError,
}

impl StageError {
    pub fn new(stage: Stage, source: DeployError) -> Self {
        Self { stage, source }
    }

    /// Human-readable message stored on the failed job.
    pub fn job_message(&self) -> String {
        truncate_utf8(&self.to_string(), MAX_MESSAGE_BYTES)
    }
}

pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T, E: Into<DeployError>> StageContext<T> for Result<T, E> {
    fn stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|e| StageError::new(stage, e.into()))
    }
}

pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}
