//! OpenCode adapter.
//!
//! The prompt is attached as a file (`--file prompt.md`) to stay clear
//! of argv limits on large task descriptions.

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

pub struct OpenCodeAdapter {
    binary: String,
    model: Option<String>,
    extra_args: Vec<String>,
    available: bool,
}

impl OpenCodeAdapter {
    pub fn new(config: &ToolchainConfig) -> Self {
        let binary = "opencode".to_string();
        Self {
            available: binary_on_path(&binary),
            model: config.model.clone(),
            extra_args: config.args.clone(),
            binary,
        }
    }

    fn build_command(&self, model: Option<&str>, prompt_file: &Path) -> Vec<String> {
        let mut cmd = vec![
            self.binary.clone(),
            "run".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--file".to_string(),
            prompt_file.display().to_string(),
            "Execute the task described in prompt.md".to_string(),
        ];
        if let Some(model) = model {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        cmd.extend(self.extra_args.iter().cloned());
        cmd
    }
}

#[async_trait]
impl ToolchainAdapter for OpenCodeAdapter {
    fn name(&self) -> &str {
        "opencode"
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
            .or_else(|| self.model.clone());
        let argv = self.build_command(model.as_deref(), &prompt_file);

        info!(
            workcell_id = %manifest.workcell_id,
            issue_id = %manifest.issue.id,
            model = model.as_deref().unwrap_or("default"),
            "Executing OpenCode"
        );

        match run_tool(&argv, workcell_path, timeout, None, &[]).await {
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
                    model.as_deref().unwrap_or(""),
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
                    "OpenCode execution timed out"
                );
                timeout_proof(manifest, workcell_path, self.name(), started_at, started)
            }
            ToolRunOutcome::LaunchFailed(e) => {
                error!(workcell_id = %manifest.workcell_id, error = %e, "OpenCode execution failed");
                error_proof(manifest, workcell_path, self.name(), started_at, started, e)
            }
        }
    }

    fn estimate_cost(&self, manifest: &Manifest) -> CostEstimate {
        let tokens = estimated_tokens(manifest);
        CostEstimate {
            estimated_tokens: tokens,
            // Open-weight backends; cost is effectively local compute.
            estimated_cost_usd: 0.0,
            model: self.model.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_attaches_prompt_file() {
        let adapter = OpenCodeAdapter::new(&ToolchainConfig::default());
        let cmd = adapter.build_command(None, Path::new("/wc/prompt.md"));
        assert_eq!(cmd[0], "opencode");
        assert_eq!(cmd[1], "run");
        assert!(cmd.windows(2).any(|w| w[0] == "--format" && w[1] == "json"));
        assert!(cmd.windows(2).any(|w| w[0] == "--file" && w[1] == "/wc/prompt.md"));
        assert!(!cmd.iter().any(|a| a == "--model"));
    }

    #[test]
    fn test_model_flag_when_configured() {
        let config = ToolchainConfig {
            model: Some("qwen3-coder".into()),
            timeout_seconds: 1800,
            args: vec![],
        };
        let adapter = OpenCodeAdapter::new(&config);
        let cmd = adapter.build_command(Some("qwen3-coder"), Path::new("/wc/prompt.md"));
        assert!(cmd.windows(2).any(|w| w[0] == "--model" && w[1] == "qwen3-coder"));
    }
}
