//! Shared execution machinery for toolchain adapters.
//!
//! Every adapter follows the same contract: write the prompt, launch
//! the tool as a child of the workcell with a timeout, capture logs,
//! read the patch out of git, classify risk, and persist a proof. The
//! pieces live here; adapters contribute command construction and
//! output parsing.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kernel::{
    utc_now_rfc3339, CommandRecord, Manifest, PatchSummary, Proof, ProofStatus, Risk,
};
use serde_json::Value;
use tracing::warn;

use crate::git::GitWorkspace;

/// Path fragments that force a `high` risk classification when they
/// appear in a modified file.
const SENSITIVE_PATTERNS: &[&str] = &[
    "auth", "security", "password", "secret", "key", "migration", "schema", "database",
    "payment", "billing",
];

pub const PROMPT_FILE: &str = "prompt.md";

/// Outcome of launching the external tool.
pub enum ToolRunOutcome {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    LaunchFailed(String),
}

/// Launch the tool process rooted at the workcell with a hard timeout.
/// The whole process group dies with the timeout. `stdin` feeds tools
/// that read their prompt from standard input.
pub async fn run_tool(
    argv: &[String],
    workcell_path: &Path,
    timeout: Duration,
    stdin: Option<&str>,
    env: &[(String, String)],
) -> ToolRunOutcome {
    if argv.is_empty() {
        return ToolRunOutcome::LaunchFailed("empty command".to_string());
    }

    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(workcell_path)
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let run = async {
        if let Some(input) = stdin {
            cmd.stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());
            let mut child = cmd.spawn()?;
            if let Some(mut pipe) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                pipe.write_all(input.as_bytes()).await?;
                drop(pipe);
            }
            child.wait_with_output().await
        } else {
            cmd.output().await
        }
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => ToolRunOutcome::Completed {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Ok(Err(e)) => ToolRunOutcome::LaunchFailed(e.to_string()),
        Err(_) => ToolRunOutcome::TimedOut,
    }
}

/// Persist tool output under `logs/`; returns the written paths.
pub fn save_logs(
    workcell_path: &Path,
    tool: &str,
    stdout: &str,
    stderr: &str,
) -> (Option<PathBuf>, Option<PathBuf>) {
    let logs_dir = workcell_path.join("logs");
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        warn!(error = %e, "Failed to create logs dir");
        return (None, None);
    }

    let mut write = |suffix: &str, contents: &str| -> Option<PathBuf> {
        if contents.is_empty() {
            return None;
        }
        let path = logs_dir.join(format!("{tool}-{suffix}.log"));
        match std::fs::write(&path, contents) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write tool log");
                None
            }
        }
    };

    (write("stdout", stdout), write("stderr", stderr))
}

/// Derive the task prompt from a manifest and write it to `prompt.md`
/// before the tool launches.
pub fn write_prompt(manifest: &Manifest, workcell_path: &Path) -> std::io::Result<PathBuf> {
    let path = workcell_path.join(PROMPT_FILE);
    std::fs::write(&path, build_prompt(manifest))?;
    Ok(path)
}

/// Render the manifest into the prompt all adapters feed their tool.
pub fn build_prompt(manifest: &Manifest) -> String {
    let issue = &manifest.issue;
    let mut prompt = String::new();

    prompt.push_str(&format!("# Task: {}\n\n", issue.title));
    prompt.push_str(&format!(
        "**Issue:** {} | **Branch:** {}\n\n",
        issue.id, manifest.branch_name
    ));

    if !issue.description.is_empty() {
        prompt.push_str(&format!("{}\n\n", issue.description));
    }

    if !issue.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance Criteria\n");
        for criterion in &issue.acceptance_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
        prompt.push('\n');
    }

    if !issue.context_files.is_empty() {
        prompt.push_str("## Relevant Files\n");
        for file in &issue.context_files {
            prompt.push_str(&format!("- `{file}`\n"));
        }
        prompt.push('\n');
    }

    if !issue.forbidden_paths.is_empty() {
        prompt.push_str("## Forbidden Paths (do NOT modify)\n");
        for path in &issue.forbidden_paths {
            prompt.push_str(&format!("- `{path}`\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Commit your changes to the current branch when done. \
         All quality gates must pass before the patch is accepted.\n",
    );

    if manifest.speculate_mode {
        prompt.push_str(
            "\nThis run is one of several parallel candidates; the best \
             verified result wins.\n",
        );
    }

    prompt
}

/// Read the patch block out of git and check it against the manifest's
/// forbidden patterns.
pub fn collect_patch_info(manifest: &Manifest, workcell_path: &Path) -> PatchSummary {
    let git = GitWorkspace::new(workcell_path);

    let head_commit = git.head().unwrap_or_default();
    let base_commit = git.merge_base("main", "HEAD");
    let range = if base_commit.is_empty() {
        // No main to diff against; compare to the branch root.
        format!("{head_commit}...{head_commit}")
    } else {
        format!("{base_commit}...HEAD")
    };

    let diff_stats = git.diff_stat(&range);
    let files_modified = git.diff_files(&range);
    let forbidden_path_violations =
        check_forbidden_paths(&files_modified, &manifest.issue.forbidden_paths);

    PatchSummary {
        branch: manifest.branch_name.clone(),
        base_commit,
        head_commit,
        diff_stats,
        files_modified,
        forbidden_path_violations,
    }
}

/// Every modified file matching a forbidden pattern is a violation.
///
/// Patterns: a trailing `/` matches the subtree, a trailing `*` matches
/// the prefix, anything else matches the exact path or the directory.
pub fn check_forbidden_paths(files_modified: &[String], forbidden: &[String]) -> Vec<String> {
    let mut violations = Vec::new();
    for file in files_modified {
        for pattern in forbidden {
            let matched = if let Some(dir) = pattern.strip_suffix('/') {
                file.starts_with(pattern) || file == dir
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file.starts_with(prefix)
            } else {
                file == pattern || file.starts_with(&format!("{pattern}/"))
            };
            if matched {
                violations.push(file.clone());
                break;
            }
        }
    }
    violations
}

/// Risk classification from the patch block: `critical` on forbidden
/// violations, `high` on sensitive paths, otherwise scaled by diff size.
pub fn classify_risk(patch: &PatchSummary) -> Risk {
    if !patch.forbidden_path_violations.is_empty() {
        return Risk::Critical;
    }

    for file in &patch.files_modified {
        let lower = file.to_lowercase();
        if SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Risk::High;
        }
    }

    let total = patch.diff_stats.total_lines();
    if total > 500 {
        Risk::High
    } else if total > 100 {
        Risk::Medium
    } else {
        Risk::Low
    }
}

/// The last parseable JSON line of stdout, where agent CLIs report
/// confidence and token usage.
pub fn parse_trailing_json(stdout: &str) -> Option<Value> {
    stdout
        .trim()
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

/// Map a tool exit code onto proof status and a default confidence.
pub fn status_from_exit(exit_code: i32) -> (ProofStatus, f64) {
    match exit_code {
        0 => (ProofStatus::Success, 0.8),
        1 => (ProofStatus::Partial, 0.5),
        _ => (ProofStatus::Failed, 0.2),
    }
}

/// Assemble and persist a proof for a completed tool run.
#[allow(clippy::too_many_arguments)]
pub fn finish_proof(
    manifest: &Manifest,
    workcell_path: &Path,
    toolchain: &str,
    model: &str,
    exit_code: i32,
    tool_output: Option<&Value>,
    started_at: String,
    started: Instant,
    log_paths: (Option<PathBuf>, Option<PathBuf>),
) -> Proof {
    let duration_ms = started.elapsed().as_millis() as u64;
    let (status, default_confidence) = status_from_exit(exit_code);

    let patch = collect_patch_info(manifest, workcell_path);
    let risk = classify_risk(&patch);

    let confidence = tool_output
        .and_then(|v| v.get("confidence"))
        .and_then(|v| v.as_f64())
        .unwrap_or(default_confidence);
    let tokens_used = tool_output
        .and_then(|v| v.get("tokens_used"))
        .and_then(|v| v.as_u64());
    let cost_usd = tool_output
        .and_then(|v| v.get("cost"))
        .and_then(|v| v.as_f64());

    let mut proof = Proof::new(&manifest.workcell_id, &manifest.issue.id, status);
    proof.patch = patch;
    proof.risk_classification = risk;
    proof.set_confidence(confidence);
    proof.metadata.toolchain = toolchain.to_string();
    proof.metadata.model = Some(model.to_string());
    proof.metadata.started_at = started_at;
    proof.metadata.completed_at = utc_now_rfc3339();
    proof.metadata.duration_ms = duration_ms;
    proof.metadata.exit_code = Some(exit_code);
    proof.metadata.tokens_used = tokens_used;
    proof.metadata.cost_usd = cost_usd;
    proof.commands_executed.push(CommandRecord {
        command: toolchain.to_string(),
        exit_code: Some(exit_code),
        duration_ms,
        stdout_path: log_paths.0.map(|p| p.display().to_string()),
        stderr_path: log_paths.1.map(|p| p.display().to_string()),
    });

    persist_proof(&proof, workcell_path);
    proof
}

/// Proof for a tool that exceeded its deadline.
pub fn timeout_proof(
    manifest: &Manifest,
    workcell_path: &Path,
    toolchain: &str,
    started_at: String,
    started: Instant,
) -> Proof {
    let mut proof = failure_proof(
        manifest,
        toolchain,
        ProofStatus::Timeout,
        started_at,
        started,
        "Execution timed out".to_string(),
    );
    proof.verification.blocking_failures = vec!["timeout".to_string()];
    persist_proof(&proof, workcell_path);
    proof
}

/// Proof for a tool that crashed or failed to launch.
pub fn error_proof(
    manifest: &Manifest,
    workcell_path: &Path,
    toolchain: &str,
    started_at: String,
    started: Instant,
    error: String,
) -> Proof {
    let mut proof = failure_proof(
        manifest,
        toolchain,
        ProofStatus::Error,
        started_at,
        started,
        error,
    );
    proof.verification.blocking_failures = vec!["error".to_string()];
    persist_proof(&proof, workcell_path);
    proof
}

fn failure_proof(
    manifest: &Manifest,
    toolchain: &str,
    status: ProofStatus,
    started_at: String,
    started: Instant,
    error: String,
) -> Proof {
    let mut proof = Proof::new(&manifest.workcell_id, &manifest.issue.id, status);
    proof.patch.branch = manifest.branch_name.clone();
    proof.risk_classification = Risk::High;
    proof.metadata.toolchain = toolchain.to_string();
    proof.metadata.started_at = started_at;
    proof.metadata.completed_at = utc_now_rfc3339();
    proof.metadata.duration_ms = started.elapsed().as_millis() as u64;
    proof.metadata.error = Some(error);
    proof
}

fn persist_proof(proof: &Proof, workcell_path: &Path) {
    if let Err(e) = proof.persist(workcell_path) {
        warn!(path = %workcell_path.display(), error = %e, "Failed to persist proof");
    }
}

/// Search PATH for an executable.
pub fn binary_on_path(name: &str) -> bool {
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(name).exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}
