//! Claude Code adapter.
//!
//! Drives the `claude` CLI in non-interactive mode: the prompt is
//! written to `prompt.md` and passed by reference, permissions are
//! skipped for autonomous operation.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kernel::{utc_now_rfc3339, Manifest, Proof, ToolchainConfig};
use tracing::{error, info};

use super::exec::{
    binary_on_path, error_proof, finish_proof, parse_trailing_json, run_tool, save_logs,
    timeout_proof, write_prompt, ToolRunOutcome,
};
use super::{estimated_tokens, CostEstimate, ToolchainAdapter};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// $/1M tokens, blended input+output.
fn cost_per_million(model: &str) -> f64 {
    if model.contains("opus") {
        45.0
    } else if model.contains("haiku") {
        0.75
    } else {
        9.0
    }
}

pub struct ClaudeAdapter {
    binary: String,
    model: String,
    extra_args: Vec<String>,
    available: bool,
}

impl ClaudeAdapter {
    pub fn new(config: &ToolchainConfig) -> Self {
        let binary = "claude".to_string();
        Self {
            available: binary_on_path(&binary),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            extra_args: config.args.clone(),
            binary,
        }
    }

    fn build_command(&self, prompt_file: &Path, model: &str) -> Vec<String> {
        let mut cmd = vec![
            self.binary.clone(),
            "--print".to_string(),
            format!("@{}", prompt_file.display()),
        ];
        if !model.is_empty() {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        // Autonomous mode: the workcell is the sandbox.
        cmd.push("--dangerously-skip-permissions".to_string());
        cmd.extend(self.extra_args.iter().cloned());
        cmd
    }
}

#[async_trait]
impl ToolchainAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn available(&self) -> bool {
        self.available
    }

    async fn health_check(&self) -> bool {
        if !self.available {
            return false;
        }
        let argv = vec![self.binary.clone(), "--version".to_string()];
        matches!(
            run_tool(&argv, Path::new("."), Duration::from_secs(10), None, &[]).await,
            ToolRunOutcome::Completed { exit_code: 0, .. }
        )
    }

    async fn execute(&self, manifest: &Manifest, workcell_path: &Path, timeout: Duration) -> Proof {
        let started_at = utc_now_rfc3339();
        let started = Instant::now();

        let prompt_file = match write_prompt(manifest, workcell_path) {
            Ok(path) => path,
            Err(e) => {
                error!(workcell_id = %manifest.workcell_id, error = %e, "Failed to write prompt");
                return error_proof(
                    manifest,
                    workcell_path,
                    self.name(),
                    started_at,
                    started,
                    format!("failed to write prompt: {e}"),
                );
            }
        };

        let model = manifest
            .toolchain_config
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        let argv = self.build_command(&prompt_file, &model);

        info!(
            workcell_id = %manifest.workcell_id,
            issue_id = %manifest.issue.id,
            model = %model,
            "Executing Claude"
        );

        match run_tool(&argv, workcell_path, timeout, None, &[]).await {
            ToolRunOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                let log_paths = save_logs(workcell_path, self.name(), &stdout, &stderr);
                let tool_output = parse_trailing_json(&stdout);
                let proof = finish_proof(
                    manifest,
                    workcell_path,
                    self.name(),
                    &model,
                    exit_code,
                    tool_output.as_ref(),
                    started_at,
                    started,
                    log_paths,
                );
                info!(
                    workcell_id = %manifest.workcell_id,
                    status = ?proof.status,
                    duration_ms = proof.metadata.duration_ms,
                    "Claude execution completed"
                );
                proof
            }
            ToolRunOutcome::TimedOut => {
                error!(
                    workcell_id = %manifest.workcell_id,
                    timeout_secs = timeout.as_secs(),
                    "Claude execution timed out"
                );
                timeout_proof(manifest, workcell_path, self.name(), started_at, started)
            }
            ToolRunOutcome::LaunchFailed(e) => {
                error!(workcell_id = %manifest.workcell_id, error = %e, "Claude execution failed");
                error_proof(manifest, workcell_path, self.name(), started_at, started, e)
            }
        }
    }

    fn estimate_cost(&self, manifest: &Manifest) -> CostEstimate {
        let model = manifest
            .toolchain_config
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        let tokens = estimated_tokens(manifest);
        CostEstimate {
            estimated_tokens: tokens,
            estimated_cost_usd: tokens as f64 / 1_000_000.0 * cost_per_million(&model),
            model,
        }
    }
}
