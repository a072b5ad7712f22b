//! Workcell manager — isolated per-task working directories.
//!
//! Each workcell is a git worktree on its own branch
//! `wc/<issue-id>/<workcell-id>`, created at the current main tip,
//! with a `logs/` subtree and empty `manifest.json` / `proof.json`
//! slots. Patch application merges the workcell branch back into main
//! under a cross-process file lock on the repo root.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use kernel::Proof;
use tracing::{info, warn};

use crate::git::GitWorkspace;

/// How long apply_patch waits for the merge lock before giving up.
const MERGE_LOCK_TIMEOUT: Duration = Duration::from_secs(120);
const MERGE_LOCK_POLL: Duration = Duration::from_millis(100);

pub struct WorkcellManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
    archive_dir: PathBuf,
    git: GitWorkspace,
}

impl WorkcellManager {
    /// Workcells live under `.dev-kernel/workcells/`, log archives under
    /// `.dev-kernel/archive/`.
    pub fn new(repo_root: impl AsRef<Path>) -> Result<Self> {
        let repo_root = repo_root.as_ref().to_path_buf();
        let git = GitWorkspace::new(&repo_root);
        if !git.is_repo() {
            bail!("Not a git repository: {}", repo_root.display());
        }

        let kernel_dir = repo_root.join(".dev-kernel");
        Ok(Self {
            base_dir: kernel_dir.join("workcells"),
            archive_dir: kernel_dir.join("archive"),
            repo_root,
            git,
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Allocate a workcell for an issue.
    ///
    /// The id is `wc-<issue>-<suffix>`: a short random suffix for single
    /// dispatch, the speculate tag for candidates.
    pub fn create(&self, issue_id: &str, speculate_tag: Option<&str>) -> Result<PathBuf> {
        let suffix = match speculate_tag {
            Some(tag) => tag.to_string(),
            None => short_random(),
        };
        let workcell_id = format!("wc-{issue_id}-{suffix}");
        let path = self.base_dir.join(&workcell_id);

        if path.exists() {
            bail!("Workcell already exists: {}", path.display());
        }
        std::fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;

        // Branch from the main tip; repos without a main branch (fresh
        // clones on master, detached CI checkouts) fall back to HEAD.
        let branch = format!("wc/{issue_id}/{workcell_id}");
        let base = if self.git.branch_exists("main") {
            Some("main")
        } else {
            None
        };
        self.git.create_worktree(&path, &branch, base)?;

        // Seed the logs subtree and the document slots.
        std::fs::create_dir_all(path.join("logs"))?;
        std::fs::write(path.join("manifest.json"), "")?;
        std::fs::write(path.join("proof.json"), "")?;

        info!(workcell_id = %workcell_id, path = %path.display(), "Workcell created");
        Ok(path)
    }

    /// Tear down a workcell. With `keep_logs`, the `logs/` subtree is
    /// archived (along with the manifest and proof) before removal.
    pub fn cleanup(&self, path: &Path, keep_logs: bool) -> Result<()> {
        let workcell_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        if keep_logs {
            if let Err(e) = self.archive_logs(path, &workcell_id) {
                warn!(workcell_id = %workcell_id, error = %e, "Failed to archive workcell logs");
            }
        }

        // Branch name comes from the checkout itself; deriving it from
        // the directory name would break on issue ids containing dashes.
        let branch = GitWorkspace::new(path).current_branch().ok();

        self.git.remove_worktree(path)?;
        if let Some(branch) = branch {
            if branch.starts_with("wc/") {
                if let Err(e) = self.git.delete_branch(&branch) {
                    warn!(branch = %branch, error = %e, "Failed to delete workcell branch");
                }
            }
        }

        info!(workcell_id = %workcell_id, kept_logs = keep_logs, "Workcell removed");
        Ok(())
    }

    fn archive_logs(&self, path: &Path, workcell_id: &str) -> Result<()> {
        let dest = self.archive_dir.join(workcell_id);
        std::fs::create_dir_all(&dest)?;

        copy_tree(&path.join("logs"), &dest.join("logs"))?;
        for doc in ["manifest.json", "proof.json"] {
            let src = path.join(doc);
            if src.exists() {
                std::fs::copy(&src, dest.join(doc))?;
            }
        }
        Ok(())
    }

    /// Merge the workcell's branch into main with a merge commit.
    ///
    /// Serialized across processes by a lock file on the repo root; the
    /// main branch is a shared resource.
    pub fn apply_patch(&self, proof: &Proof, workcell_path: &Path) -> bool {
        let branch = if proof.patch.branch.is_empty() {
            match GitWorkspace::new(workcell_path).current_branch() {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "No branch to merge");
                    return false;
                }
            }
        } else {
            proof.patch.branch.clone()
        };

        let _lock = match MergeLock::acquire(&self.repo_root) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "Failed to acquire merge lock");
                return false;
            }
        };

        match self.git.merge(&branch, &format!("Merge {branch}")) {
            Ok(()) => {
                info!(branch = %branch, "Patch applied");
                true
            }
            Err(e) => {
                warn!(branch = %branch, error = %e, "Failed to merge");
                false
            }
        }
    }
}

/// Exclusive cross-process lock, held for the duration of one merge.
struct MergeLock {
    path: PathBuf,
}

impl MergeLock {
    fn acquire(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(".dev-kernel");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("merge.lock");

        let deadline = Instant::now() + MERGE_LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        bail!("Timed out waiting for merge lock at {}", path.display());
                    }
                    std::thread::sleep(MERGE_LOCK_POLL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create merge lock at {}", path.display())
                    })
                }
            }
        }
    }
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn short_random() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_file, init_repo};
    use kernel::ProofStatus;

    fn manager(dir: &Path) -> WorkcellManager {
        init_repo(dir);
        WorkcellManager::new(dir).unwrap()
    }

    #[test]
    fn test_create_seeds_slots_and_branch() {
        let dir = tempfile::tempdir().unwrap();
        let wm = manager(dir.path());

        let path = wm.create("7", None).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("wc-7-"));
        assert!(path.join("logs").is_dir());
        assert!(path.join("manifest.json").exists());
        assert!(path.join("proof.json").exists());

        let branch = GitWorkspace::new(&path).current_branch().unwrap();
        assert_eq!(branch, format!("wc/7/{name}"));
    }

    #[test]
    fn test_speculate_tag_in_workcell_id() {
        let dir = tempfile::tempdir().unwrap();
        let wm = manager(dir.path());

        let path = wm.create("7", Some("spec-claude")).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "wc-7-spec-claude"
        );
        // The same tag twice collides.
        assert!(wm.create("7", Some("spec-claude")).is_err());
    }

    #[test]
    fn test_cleanup_removes_tree_and_branch() {
        let dir = tempfile::tempdir().unwrap();
        let wm = manager(dir.path());
        let git = GitWorkspace::new(dir.path());

        let path = wm.create("3", None).unwrap();
        let branch = GitWorkspace::new(&path).current_branch().unwrap();

        wm.cleanup(&path, false).unwrap();
        assert!(!path.exists());
        assert!(!git.branch_exists(&branch));
    }

    #[test]
    fn test_cleanup_keep_logs_archives() {
        let dir = tempfile::tempdir().unwrap();
        let wm = manager(dir.path());

        let path = wm.create("3", Some("spec-codex")).unwrap();
        std::fs::write(path.join("logs").join("claude-stdout.log"), "output").unwrap();
        std::fs::write(path.join("proof.json"), "{\"kept\": true}").unwrap();

        wm.cleanup(&path, true).unwrap();
        let archived = dir
            .path()
            .join(".dev-kernel/archive/wc-3-spec-codex");
        assert!(archived.join("logs/claude-stdout.log").exists());
        assert!(archived.join("proof.json").exists());
    }

    #[test]
    fn test_apply_patch_merges_to_main() {
        let dir = tempfile::tempdir().unwrap();
        let wm = manager(dir.path());

        let path = wm.create("5", None).unwrap();
        commit_file(&path, "new_module.rs", "pub fn added() {}\n", "workcell change");

        let mut proof = Proof::new(
            path.file_name().unwrap().to_str().unwrap(),
            "5",
            ProofStatus::Success,
        );
        proof.patch.branch = GitWorkspace::new(&path).current_branch().unwrap();

        assert!(wm.apply_patch(&proof, &path));
        assert!(dir.path().join("new_module.rs").exists());
        // Lock released after the merge.
        assert!(!dir.path().join(".dev-kernel/merge.lock").exists());
    }

    #[test]
    fn test_apply_patch_blocked_by_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let lock = MergeLock::acquire(dir.path()).unwrap();
        // A second acquire must wait; with the lock held it times out,
        // so just verify the file exists and drops cleanly.
        assert!(dir.path().join(".dev-kernel/merge.lock").exists());
        drop(lock);
        assert!(!dir.path().join(".dev-kernel/merge.lock").exists());
    }

    #[test]
    fn test_non_repo_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WorkcellManager::new(dir.path()).is_err());
    }
}
