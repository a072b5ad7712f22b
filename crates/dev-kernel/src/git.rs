//! Git plumbing for workcells and patch application.
//!
//! Thin wrappers over the ambient `git` binary. Every operation the
//! kernel needs from the VCS lives here: worktree lifecycle, merges,
//! commit lookups, and diff statistics for proof patch blocks.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use kernel::DiffStats;
use regex::Regex;
use tracing::warn;

/// A git checkout rooted at a fixed directory (the main repo or one of
/// its worktrees).
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    root: PathBuf,
}

impl GitWorkspace {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Is the root inside a git repository?
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"]).is_ok()
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(output)
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Current HEAD commit hash.
    pub fn head(&self) -> Result<String> {
        self.stdout(&["rev-parse", "HEAD"])
    }

    pub fn current_branch(&self) -> Result<String> {
        self.stdout(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Merge base of two refs; empty when either side is unknown.
    pub fn merge_base(&self, a: &str, b: &str) -> String {
        self.stdout(&["merge-base", a, b]).unwrap_or_default()
    }

    /// Does a local branch exist?
    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
        .is_ok()
    }

    /// Diff statistics for a revision range, parsed from the
    /// `git diff --stat` summary line.
    pub fn diff_stat(&self, range: &str) -> DiffStats {
        let Ok(stdout) = self.stdout(&["diff", "--stat", range]) else {
            return DiffStats::default();
        };
        parse_diff_stat_summary(&stdout)
    }

    /// Paths modified in a revision range.
    pub fn diff_files(&self, range: &str) -> Vec<String> {
        match self.stdout(&["diff", "--name-only", range]) {
            Ok(stdout) => stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(e) => {
                warn!(range, error = %e, "git diff --name-only failed");
                Vec::new()
            }
        }
    }

    /// Merge a branch into the current branch with a merge commit.
    pub fn merge(&self, branch: &str, message: &str) -> Result<()> {
        self.run(&["merge", "--no-ff", branch, "-m", message])?;
        Ok(())
    }

    /// Provision a worktree on a new branch at `base` (HEAD when unset).
    pub fn create_worktree(&self, path: &Path, branch: &str, base: Option<&str>) -> Result<()> {
        let path_str = path.display().to_string();
        let mut args = vec!["worktree", "add", "-b", branch, &path_str];
        if let Some(base) = base {
            args.push(base);
        }
        self.run(&args)?;
        Ok(())
    }

    /// Remove a worktree; falls back to deleting the directory when the
    /// worktree metadata is already gone.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.display().to_string();
        if let Err(e) = self.run(&["worktree", "remove", "--force", &path_str]) {
            warn!(path = %path.display(), error = %e, "git worktree remove failed");
            if path.exists() {
                std::fs::remove_dir_all(path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
                let _ = self.run(&["worktree", "prune"]);
            }
        }
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "-D", branch])?;
        Ok(())
    }
}

/// Parse the trailing summary of `git diff --stat`:
/// `" 3 files changed, 41 insertions(+), 7 deletions(-)"`.
fn parse_diff_stat_summary(stdout: &str) -> DiffStats {
    let Some(summary) = stdout.lines().last() else {
        return DiffStats::default();
    };

    let capture_number = |pattern: &str| -> u64 {
        Regex::new(pattern)
            .ok()
            .and_then(|re| re.captures(summary))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    DiffStats {
        files_changed: capture_number(r"(\d+) files? changed"),
        insertions: capture_number(r"(\d+) insertions?"),
        deletions: capture_number(r"(\d+) deletions?"),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Set up a throwaway git repo with one commit on `main`.
    pub fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .expect("git");
            assert!(
                out.status.success(),
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&out.stderr)
            );
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "kernel@test"]);
        run(&["config", "user.name", "Kernel Test"]);
        std::fs::write(dir.join("README.md"), "seed\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
        for args in [&["add", "."][..], &["commit", "-m", message][..]] {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .expect("git");
            assert!(out.status.success());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_head_and_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = GitWorkspace::new(dir.path());

        assert!(git.is_repo());
        assert_eq!(git.current_branch().unwrap(), "main");
        assert_eq!(git.head().unwrap().len(), 40);
    }

    #[test]
    fn test_worktree_lifecycle_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = GitWorkspace::new(dir.path());

        let wt = dir.path().join("wt-1");
        git.create_worktree(&wt, "wc/1/wc-1-a", None).unwrap();
        assert!(wt.join("README.md").exists());

        commit_file(&wt, "feature.rs", "pub fn f() {}\n", "add feature");

        git.merge("wc/1/wc-1-a", "Merge wc/1/wc-1-a").unwrap();
        assert!(dir.path().join("feature.rs").exists());

        git.remove_worktree(&wt).unwrap();
        assert!(!wt.exists());
        git.delete_branch("wc/1/wc-1-a").unwrap();
        assert!(!git.branch_exists("wc/1/wc-1-a"));
    }

    #[test]
    fn test_diff_stat_and_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = GitWorkspace::new(dir.path());
        let base = git.head().unwrap();

        commit_file(dir.path(), "a.rs", "line one\nline two\n", "change");

        let stats = git.diff_stat(&format!("{base}...HEAD"));
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.deletions, 0);

        let files = git.diff_files(&format!("{base}...HEAD"));
        assert_eq!(files, vec!["a.rs"]);
    }

    #[test]
    fn test_merge_base() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = GitWorkspace::new(dir.path());
        let first = git.head().unwrap();

        commit_file(dir.path(), "b.rs", "x\n", "second");
        assert_eq!(git.merge_base(&first, "HEAD"), first);
        assert_eq!(git.merge_base("no-such-ref", "HEAD"), "");
    }

    #[test]
    fn test_parse_diff_stat_summary() {
        let stats = parse_diff_stat_summary(
            " src/a.rs | 10 +++++-----\n 3 files changed, 41 insertions(+), 7 deletions(-)",
        );
        assert_eq!(stats.files_changed, 3);
        assert_eq!(stats.insertions, 41);
        assert_eq!(stats.deletions, 7);

        assert_eq!(parse_diff_stat_summary(""), DiffStats::default());
    }
}
