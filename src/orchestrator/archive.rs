//! Source snapshot shipped to every instance.
//!
//! The snapshot holds what `git` knows about (tracked files plus untracked
//! files that are not ignored) and that exists on disk. Outside a git
//! checkout the whole tree is archived, minus `.git` and the state
//! directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::provider::Tool;

/// File name of the snapshot inside the state directory.
pub const ARCHIVE_NAME: &str = "source.tar";

/// Writes `{state_dir}/source.tar` from `repo_dir` and returns its path.
pub async fn create_repo_archive(repo_dir: &Path, state_dir: &Path) -> Result<PathBuf> {
    let archive = state_dir.join(ARCHIVE_NAME);
    info!("Creating source snapshot of {}", repo_dir.display());

    let files = match git_files(repo_dir).await {
        Ok(files) => files,
        Err(e) => {
            warn!("Not archiving from git ({}), walking {}", e, repo_dir.display());
            walk_files(repo_dir, state_dir)
        }
    };
    debug!("Archiving {} files", files.len());

    let repo = repo_dir.to_path_buf();
    let dest = archive.clone();
    tokio::task::spawn_blocking(move || write_archive(&repo, &files, &dest))
        .await
        .context("snapshot task panicked")??;
    Ok(archive)
}

async fn git_files(repo_dir: &Path) -> Result<Vec<PathBuf>> {
    let out = Tool::new("git")
        .args(["ls-files", "-z", "--cached", "--others", "--exclude-standard"])
        .current_dir(repo_dir)
        .output()
        .await?;
    let mut files: Vec<PathBuf> = out
        .stdout
        .split('\0')
        .filter(|f| !f.is_empty())
        .map(PathBuf::from)
        // Deleted but still tracked files are listed too.
        .filter(|f| repo_dir.join(f).is_file())
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

fn walk_files(repo_dir: &Path, state_dir: &Path) -> Vec<PathBuf> {
    let state_dir = state_dir.canonicalize().ok();
    let mut files: Vec<PathBuf> = WalkDir::new(repo_dir)
        .into_iter()
        .filter_entry(|entry| {
            if entry.file_name() == ".git" {
                return false;
            }
            match (&state_dir, entry.path().canonicalize()) {
                (Some(state), Ok(path)) => path != *state,
                _ => true,
            }
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(repo_dir)
                .ok()
                .map(Path::to_path_buf)
        })
        .collect();
    files.sort();
    files
}

fn write_archive(repo_dir: &Path, files: &[PathBuf], dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(dest);
    let file = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut builder = tar::Builder::new(file);
    for rel in files {
        builder
            .append_path_with_name(repo_dir.join(rel), rel)
            .with_context(|| format!("Failed to archive {}", rel.display()))?;
    }
    builder.into_inner()?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(archive: &Path) -> Vec<String> {
        let file = std::fs::File::open(archive).unwrap();
        let mut archive = tar::Archive::new(file);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_walk_skips_git_and_state_dir() {
        let repo = tempfile::tempdir().unwrap();
        let root = repo.path();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(root.join(".integration-cache")).unwrap();
        std::fs::write(root.join(".integration-cache/id_rsa"), "key").unwrap();
        std::fs::create_dir_all(root.join("pkg")).unwrap();
        std::fs::write(root.join("pkg/main.go"), "package main").unwrap();
        std::fs::write(root.join("go.mod"), "module x").unwrap();

        let files = walk_files(root, &root.join(".integration-cache"));
        assert_eq!(files, vec![PathBuf::from("go.mod"), PathBuf::from("pkg/main.go")]);
    }

    #[tokio::test]
    async fn test_archive_outside_git_checkout() {
        let repo = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("testing")).unwrap();
        std::fs::write(repo.path().join("testing/a_test.go"), "package testing").unwrap();

        let archive = create_repo_archive(repo.path(), state.path()).await.unwrap();
        assert_eq!(archive, state.path().join(ARCHIVE_NAME));
        assert_eq!(entries(&archive), vec!["testing/a_test.go"]);
    }
}
