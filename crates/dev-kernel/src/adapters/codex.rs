//! Codex CLI adapter.
//!
//! Codex reads its prompt from stdin (`codex exec -`); the sandbox and
//! approval flags are pinned for unattended operation.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kernel::{utc_now_rfc3339, Manifest, Proof, ToolchainConfig};
use tracing::{error, info};

use super::exec::{
    binary_on_path, build_prompt, error_proof, finish_proof, parse_trailing_json, run_tool,
    save_logs, timeout_proof, write_prompt, ToolRunOutcome,
};
use super::{estimated_tokens, CostEstimate, ToolchainAdapter};

const DEFAULT_MODEL: &str = "o3";

pub struct CodexAdapter {
    binary: String,
    model: String,
    extra_args: Vec<String>,
    available: bool,
}

impl CodexAdapter {
    pub fn new(config: &ToolchainConfig) -> Self {
        let binary = "codex".to_string();
        Self {
            available: binary_on_path(&binary),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            extra_args: config.args.clone(),
            binary,
        }
    }

    fn build_command(&self, model: &str) -> Vec<String> {
        let mut cmd = vec![
            self.binary.clone(),
            "exec".to_string(),
            // Read the prompt from stdin.
            "-".to_string(),
            "--sandbox".to_string(),
            "workspace-write".to_string(),
            "--ask-for-approval".to_string(),
            "never".to_string(),
        ];
        if !model.is_empty() {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        cmd.extend(self.extra_args.iter().cloned());
        cmd
    }
}

#[async_trait]
impl ToolchainAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
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

        // The prompt goes over stdin, but prompt.md is still written so
        // the workcell documents what the tool was asked to do.
        let prompt = build_prompt(manifest);
        if let Err(e) = write_prompt(manifest, workcell_path) {
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

        let model = manifest
            .toolchain_config
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        let argv = self.build_command(&model);

        info!(
            workcell_id = %manifest.workcell_id,
            issue_id = %manifest.issue.id,
            model = %model,
            "Executing Codex"
        );

        match run_tool(&argv, workcell_path, timeout, Some(&prompt), &[]).await {
            ToolRunOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                let log_paths = save_logs(workcell_path, self.name(), &stdout, &stderr);
                let tool_output = parse_trailing_json(&stdout);
                finish_proof(
                    manifest,
                    workcell_path,
                    self.name(),
                    &model,
                    exit_code,
                    tool_output.as_ref(),
                    started_at,
                    started,
                    log_paths,
                )
            }
            ToolRunOutcome::TimedOut => {
                error!(
                    workcell_id = %manifest.workcell_id,
                    timeout_secs = timeout.as_secs(),
                    "Codex execution timed out"
                );
                timeout_proof(manifest, workcell_path, self.name(), started_at, started)
            }
            ToolRunOutcome::LaunchFailed(e) => {
                error!(workcell_id = %manifest.workcell_id, error = %e, "Codex execution failed");
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
        // o-series pricing, blended.
        let cost_per_million = if model.starts_with("o3") { 10.0 } else { 4.0 };
        CostEstimate {
            estimated_tokens: tokens,
            estimated_cost_usd: tokens as f64 / 1_000_000.0 * cost_per_million,
            model,
        }
    }
}
