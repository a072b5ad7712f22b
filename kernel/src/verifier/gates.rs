//! Generic runner for code gates (test / typecheck / lint).
//!
//! Each gate is a configured command string, shlex-split and launched in
//! the workcell with an enforced timeout. Output is captured to
//! `logs/gates/<name>.log`; the gate passes iff the exit code is zero.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::proof::GateResult;

pub struct GateRunner {
    cwd: PathBuf,
    logs_dir: PathBuf,
    timeout: Duration,
}

impl GateRunner {
    pub fn new(cwd: impl AsRef<Path>, logs_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            logs_dir: logs_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Run every code gate in name order. Gates are independent; a
    /// failure doesn't stop the rest (the report needs all of them).
    pub async fn run_all(&self, gates: &BTreeMap<String, String>) -> BTreeMap<String, GateResult> {
        let mut results = BTreeMap::new();
        for (name, command) in gates {
            let result = self.run_gate(name, command).await;
            info!(
                gate = %name,
                passed = result.passed,
                duration_ms = result.duration_ms,
                "Code gate finished"
            );
            results.insert(name.clone(), result);
        }
        results
    }

    /// Run one gate command.
    pub async fn run_gate(&self, name: &str, command: &str) -> GateResult {
        let start = Instant::now();

        let Some(argv) = shlex::split(command).filter(|a| !a.is_empty()) else {
            return GateResult {
                passed: false,
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some(format!("unparseable gate command: {command:?}")),
                ..Default::default()
            };
        };

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.cwd)
            .kill_on_drop(true);
        // New process group so a timeout kills the whole tree, not just
        // the immediate child.
        #[cfg(unix)]
        cmd.process_group(0);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return GateResult {
                    passed: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(format!("failed to execute: {e}")),
                    ..Default::default()
                };
            }
            Err(_) => {
                return GateResult {
                    passed: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some("timeout".to_string()),
                    ..Default::default()
                };
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        self.save_log(name, &output.stdout, &output.stderr);

        let passed = output.status.success();
        let stderr_excerpt = if passed {
            None
        } else {
            Some(truncate(&String::from_utf8_lossy(&output.stderr), 2000))
        };

        GateResult {
            passed,
            exit_code: output.status.code(),
            duration_ms,
            stderr: stderr_excerpt,
            ..Default::default()
        }
    }

    fn save_log(&self, name: &str, stdout: &[u8], stderr: &[u8]) {
        if let Err(e) = std::fs::create_dir_all(&self.logs_dir) {
            warn!(dir = %self.logs_dir.display(), error = %e, "Failed to create gate logs dir");
            return;
        }
        let path = self.logs_dir.join(format!("{name}.log"));
        let mut contents = Vec::with_capacity(stdout.len() + stderr.len() + 32);
        contents.extend_from_slice(stdout);
        if !stderr.is_empty() {
            contents.extend_from_slice(b"\n--- stderr ---\n");
            contents.extend_from_slice(stderr);
        }
        if let Err(e) = std::fs::write(&path, contents) {
            warn!(path = %path.display(), error = %e, "Failed to write gate log");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...\n[truncated at {} bytes]", &s[..end], s.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(dir: &Path) -> GateRunner {
        GateRunner::new(dir, dir.join("logs").join("gates"), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_passing_gate() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path()).run_gate("test", "true").await;
        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_failing_gate_captures_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path()).run_gate("lint", "false").await;
        assert!(!result.passed);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_binary_is_failure_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path())
            .run_gate("test", "definitely-not-a-real-binary-xyz")
            .await;
        assert!(!result.passed);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = GateRunner::new(
            dir.path(),
            dir.path().join("logs"),
            Duration::from_millis(100),
        );
        let result = runner.run_gate("test", "sleep 5").await;
        assert!(!result.passed);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_gate_output_logged() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        r.run_gate("test", "echo hello-from-gate").await;
        let log = std::fs::read_to_string(dir.path().join("logs/gates/test.log")).unwrap();
        assert!(log.contains("hello-from-gate"));
    }

    #[tokio::test]
    async fn test_run_all_runs_every_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut gates = BTreeMap::new();
        gates.insert("lint".to_string(), "false".to_string());
        gates.insert("test".to_string(), "true".to_string());

        let results = runner(dir.path()).run_all(&gates).await;
        assert_eq!(results.len(), 2);
        assert!(!results["lint"].passed);
        assert!(results["test"].passed);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld, this is a long line";
        let t = truncate(s, 2);
        assert!(t.starts_with('h'));
        assert!(t.contains("truncated"));
    }
}
