//! Fab gate execution — external asset-evaluation pipelines.
//!
//! A fab gate renders/evaluates a 3D asset out-of-process and reports a
//! structured JSON verdict on stdout. The verdict overrides the exit
//! code; a gate with `verdict: "pass"` passes even if the harness exited
//! non-zero, and vice versa.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::manifest::FabGateSpec;
use crate::proof::{GateResult, NextAction, Verdict};

/// Asset extensions the gate harness understands.
const ASSET_EXTENSIONS: &[&str] = &["glb", "gltf", "blend"];

/// Subdirectories searched for assets after the workcell root.
const ASSET_SUBDIRS: &[&str] = &["output", "assets", "export"];

/// Structured stdout of a fab gate binary. The verdict arrives as a raw
/// string; unknown values are ignored rather than failing the parse.
#[derive(Debug, Deserialize)]
struct FabGateOutput {
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default)]
    scores: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    failures: Option<Value>,
    #[serde(default)]
    next_actions: Vec<NextAction>,
    #[serde(default)]
    artifacts: Option<Value>,
}

impl FabGateOutput {
    fn known_verdict(&self) -> Option<Verdict> {
        match self.verdict.as_deref() {
            Some("pass") => Some(Verdict::Pass),
            Some("fail") => Some(Verdict::Fail),
            Some("escalate") => Some(Verdict::Escalate),
            _ => None,
        }
    }
}

pub struct FabGateRunner {
    workcell: PathBuf,
    timeout: Duration,
}

impl FabGateRunner {
    pub fn new(workcell: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            workcell: workcell.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Execute one fab gate and parse its verdict.
    pub async fn run(&self, gate_name: &str, spec: &FabGateSpec) -> GateResult {
        let start = Instant::now();

        let Some(asset_path) = find_asset_file(&self.workcell) else {
            return GateResult {
                passed: false,
                exit_code: Some(1),
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some("no asset file found".to_string()),
                ..Default::default()
            };
        };

        let output_dir = self.workcell.join("logs").join("fab").join(gate_name);
        let argv = build_command(gate_name, spec, &asset_path, &output_dir);
        info!(gate = %gate_name, command = %argv.join(" "), "Running fab gate");

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.workcell)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(gate = %gate_name, error = %e, "Fab gate failed to launch");
                return GateResult {
                    passed: false,
                    exit_code: Some(-1),
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
            Err(_) => {
                return GateResult {
                    passed: false,
                    exit_code: Some(-1),
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some("timeout".to_string()),
                    ..Default::default()
                };
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut result = GateResult {
            passed: output.status.success(),
            exit_code: output.status.code(),
            duration_ms,
            ..Default::default()
        };

        if let Some(parsed) = parse_gate_output(&stdout) {
            if let Some(verdict) = parsed.known_verdict() {
                // Structured verdict is authoritative.
                result.passed = verdict == Verdict::Pass;
                result.verdict = Some(verdict);
            }
            result.scores = parsed.scores;
            result.failures = parsed.failures;
            result.next_actions = parsed.next_actions;
            result.artifacts = parsed.artifacts;
        }

        if !stderr.is_empty() {
            result.stderr = Some(stderr.chars().take(1000).collect());
        }

        info!(
            gate = %gate_name,
            passed = result.passed,
            verdict = ?result.verdict,
            duration_ms,
            "Fab gate completed"
        );

        result
    }
}

/// Build the gate argv: explicit `command` override wins, otherwise the
/// gate kind doubles as the harness binary name.
fn build_command(
    gate_name: &str,
    spec: &FabGateSpec,
    asset_path: &Path,
    output_dir: &Path,
) -> Vec<String> {
    let mut argv: Vec<String> = match spec.command.as_deref().and_then(shlex::split) {
        Some(custom) if !custom.is_empty() => custom,
        _ => {
            let program = if spec.kind.is_empty() {
                gate_name.to_string()
            } else {
                spec.kind.clone()
            };
            vec![program]
        }
    };

    argv.push("--asset".to_string());
    argv.push(asset_path.display().to_string());
    if let Some(config_id) = &spec.gate_config_id {
        argv.push("--config".to_string());
        argv.push(config_id.clone());
    }
    argv.push("--out".to_string());
    argv.push(output_dir.display().to_string());
    argv.push("--json".to_string());
    if let Some(template_dir) = &spec.template_dir {
        argv.push("--template-dir".to_string());
        argv.push(template_dir.clone());
    }

    argv
}

/// Find the asset the gate should evaluate: workcell root first, then
/// the conventional output directories. Candidates sort by name so the
/// pick is deterministic.
pub fn find_asset_file(workcell: &Path) -> Option<PathBuf> {
    let mut dirs = vec![workcell.to_path_buf()];
    dirs.extend(ASSET_SUBDIRS.iter().map(|d| workcell.join(d)));

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| ASSET_EXTENSIONS.contains(&e))
                        .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        if let Some(first) = candidates.into_iter().next() {
            return Some(first);
        }
    }

    None
}

fn parse_gate_output(stdout: &str) -> Option<FabGateOutput> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Whole-stdout JSON first, then a trailing JSON line (harnesses that
    // log progress before the verdict).
    serde_json::from_str(trimmed)
        .ok()
        .or_else(|| trimmed.lines().rev().find_map(|l| serde_json::from_str(l.trim()).ok()))
}
