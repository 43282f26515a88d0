use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;

use crate::broker::LogSink;
use crate::error::{DeployError, DeployResult};
use crate::runner;
use crate::workspace::normalize_rel_path;

/// Materializes application source into an empty workspace directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn clone_or_checkout(
        &self,
        repository: &str,
        branch: &str,
        dest: &Path,
        log: &LogSink,
    ) -> DeployResult<()>;

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> DeployResult<()>;
}

pub struct GitFetcher {
    git_bin: String,
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            git_bin: "git".to_string(),
            timeout,
        }
    }
}

/// A failed git run becomes a fetch error that still says what git complained about.
fn fetch_error(err: DeployError) -> DeployError {
    match err {
        DeployError::Command {
            ref output_tail, ..
        } => {
            let reason = output_tail.trim();
            if reason.is_empty() {
                DeployError::Fetch(err.to_string())
            } else {
                DeployError::Fetch(format!("{err}: {reason}"))
            }
        }
        other => other,
    }
}

/// Refuse values git would read as an option.
fn check_git_arg(field: &str, value: &str) -> DeployResult<()> {
    if value.trim().is_empty() {
        return Err(DeployError::validation(field, "must not be empty"));
    }
    if value.starts_with('-') {
        return Err(DeployError::validation(field, "must not start with '-'"));
    }
    Ok(())
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn clone_or_checkout(
        &self,
        repository: &str,
        branch: &str,
        dest: &Path,
        log: &LogSink,
    ) -> DeployResult<()> {
        check_git_arg("repository", repository)?;
        check_git_arg("branch", branch)?;
        let dest_str = dest.to_string_lossy();
        let parent = dest.parent().unwrap_or(dest);

        log.note(format!("cloning {repository} (branch {branch})"));
        runner::run_program(
            &self.git_bin,
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                branch,
                "--",
                repository,
                &dest_str,
            ],
            parent,
            self.timeout,
            log,
        )
        .await
        .map_err(fetch_error)?;
        Ok(())
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> DeployResult<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_flattened(&archive, &dest))
            .await
            .map_err(|e| DeployError::Fetch(format!("extract task failed: {e}")))?
    }
}

/// Extract `archive` into `dest`, lifting a single wrapping directory to the top.
pub fn extract_flattened(archive: &Path, dest: &Path) -> DeployResult<()> {
    let staging = dest.join(".extract");
    extract_zip_safely(archive, &staging)?;
    let root = find_flatten_root(&staging);
    move_children(&root, dest)?;
    fs::remove_dir_all(&staging).ok();
    Ok(())
}

fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> DeployResult<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(f)
        .map_err(|e| DeployError::Fetch(format!("invalid zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| DeployError::Fetch(format!("read zip entry {i}: {e}")))?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)
            .map_err(|e| DeployError::Fetch(format!("invalid zip path {trimmed:?}: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777)).ok();
        }
    }
    Ok(())
}

fn find_flatten_root(extracted: &Path) -> PathBuf {
    let Ok(rd) = fs::read_dir(extracted) else {
        return extracted.to_path_buf();
    };
    let mut entries: Vec<PathBuf> = rd
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().and_then(|s| s.to_str()).unwrap_or("");
            name != "__MACOSX" && name != ".DS_Store"
        })
        .collect();
    if entries.len() == 1 && entries[0].is_dir() {
        entries.remove(0)
    } else {
        extracted.to_path_buf()
    }
}

fn move_children(src: &Path, dst: &Path) -> DeployResult<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == "__MACOSX" || name == ".extract" {
            continue;
        }
        let meta = fs::symlink_metadata(entry.path())?;
        if meta.file_type().is_symlink() {
            continue;
        }
        let target = dst.join(&name);
        if target.exists() {
            return Err(DeployError::Fetch(format!(
                "destination exists: {}",
                target.display()
            )));
        }
        fs::rename(entry.path(), target)?;
    }
    Ok(())
}
