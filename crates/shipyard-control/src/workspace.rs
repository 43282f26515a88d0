//! On-disk layout for application sources.
//!
//! ```text
//! <data_root>/workspaces/<app>/job-<id>/   one directory per build
//! <data_root>/uploads/<app>/<uuid>.zip     retained archives for file apps
//! ```

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use shipyard_job::JobId;

use crate::error::{DeployError, DeployResult};

const JOB_DIR_PREFIX: &str = "job-";

/// Resolve a relative path, refusing anything that could escape its base.
pub(crate) fn normalize_rel_path(rel: &str) -> DeployResult<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(DeployError::validation("path", "path must be relative"));
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(DeployError::validation("path", "path traversal is not allowed"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(DeployError::validation("path", "path must be relative"));
            }
        }
    }
    Ok(out)
}

/// Remove a directory tree, treating "already gone" as success.
pub(crate) async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(app)
    }

    pub fn job_dir(&self, app: &str, job_id: JobId) -> PathBuf {
        self.app_dir(app).join(format!("{JOB_DIR_PREFIX}{job_id}"))
    }

    /// Create an empty directory for this job's build.
    ///
    /// Leftover job directories of the same app are cleared first, except `keep`
    /// (the directory the live service runs from).
    pub async fn prepare(
        &self,
        app: &str,
        job_id: JobId,
        keep: Option<&Path>,
    ) -> DeployResult<PathBuf> {
        let app_dir = self.app_dir(app);
        tokio::fs::create_dir_all(&app_dir).await?;

        let mut rd = tokio::fs::read_dir(&app_dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            let is_job_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(JOB_DIR_PREFIX));
            if !is_job_dir || keep.is_some_and(|k| k == path) {
                continue;
            }
            tracing::debug!(app, dir = %path.display(), "removing stale workspace");
            remove_dir_if_exists(&path).await?;
        }

        let dir = self.job_dir(app, job_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn remove_app(&self, app: &str) -> DeployResult<()> {
        remove_dir_if_exists(&self.app_dir(app)).await?;
        Ok(())
    }
}

/// Uploaded archives, retained so file apps can be redeployed.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist an archive and return its opaque reference.
    pub async fn save(&self, app: &str, bytes: &[u8]) -> DeployResult<String> {
        let dir = self.root.join(app);
        tokio::fs::create_dir_all(&dir).await?;

        let reference = format!("{app}/{}.zip", uuid::Uuid::new_v4());
        let path = self.root.join(&reference);
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(reference)
    }

    pub fn path(&self, reference: &str) -> DeployResult<PathBuf> {
        let rel = normalize_rel_path(reference.trim())?;
        if rel.as_os_str().is_empty() {
            return Err(DeployError::validation("upload", "missing upload reference"));
        }
        Ok(self.root.join(rel))
    }

    pub async fn exists(&self, reference: &str) -> bool {
        match self.path(reference) {
            Ok(p) => tokio::fs::metadata(p).await.is_ok_and(|m| m.is_file()),
            Err(_) => false,
        }
    }

    pub async fn remove(&self, reference: &str) -> DeployResult<()> {
        let path = self.path(reference)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_app(&self, app: &str) -> DeployResult<()> {
        remove_dir_if_exists(&self.root.join(app)).await?;
        Ok(())
    }
}
