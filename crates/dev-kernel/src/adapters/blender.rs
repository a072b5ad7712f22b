//! Blender asset-agent adapter.
//!
//! Runs Blender headless over a generation script from the workcell to
//! produce a 3D asset for fab-gated issues. Execution is pinned for
//! determinism (factory startup, fixed PYTHONHASHSEED).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kernel::verifier::find_asset_file;
use kernel::{utc_now_rfc3339, Manifest, Proof, ProofStatus, ToolchainConfig};
use tracing::{error, info, warn};

use super::exec::{
    binary_on_path, error_proof, finish_proof, parse_trailing_json, run_tool, save_logs,
    timeout_proof, write_prompt, ToolRunOutcome,
};
use super::{estimated_tokens, CostEstimate, ToolchainAdapter};

/// Script locations probed inside the workcell, in order.
const SCRIPT_CANDIDATES: &[&str] = &["blender/generate.py", "generate.py"];

pub struct BlenderAdapter {
    binary: String,
    extra_args: Vec<String>,
    available: bool,
}

impl BlenderAdapter {
    pub fn new(config: &ToolchainConfig) -> Self {
        let binary = "blender".to_string();
        Self {
            available: binary_on_path(&binary),
            extra_args: config.args.clone(),
            binary,
        }
    }

    /// The generation script: first probe the conventional locations,
    /// then any `.py` among the issue's context files.
    fn find_script(&self, manifest: &Manifest, workcell_path: &Path) -> Option<PathBuf> {
        for candidate in SCRIPT_CANDIDATES {
            let path = workcell_path.join(candidate);
            if path.is_file() {
                return Some(path);
            }
        }
        manifest
            .issue
            .context_files
            .iter()
            .filter(|f| f.ends_with(".py"))
            .map(|f| workcell_path.join(f))
            .find(|p| p.is_file())
    }

    fn build_command(&self, script: &Path) -> Vec<String> {
        let mut cmd = vec![
            self.binary.clone(),
            "--factory-startup".to_string(),
            "--background".to_string(),
            "--python".to_string(),
            script.display().to_string(),
        ];
        cmd.extend(self.extra_args.iter().cloned());
        cmd
    }
}

#[async_trait]
impl ToolchainAdapter for BlenderAdapter {
    fn name(&self) -> &str {
        "blender"
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

        // prompt.md still documents the task, even though Blender reads
        // the generation script rather than the prompt.
        if let Err(e) = write_prompt(manifest, workcell_path) {
            warn!(workcell_id = %manifest.workcell_id, error = %e, "Failed to write prompt");
        }

        let Some(script) = self.find_script(manifest, workcell_path) else {
            error!(
                workcell_id = %manifest.workcell_id,
                "No Blender generation script in workcell"
            );
            return error_proof(
                manifest,
                workcell_path,
                self.name(),
                started_at,
                started,
                "no generation script found".to_string(),
            );
        };

        let argv = self.build_command(&script);
        let env = [("PYTHONHASHSEED".to_string(), "0".to_string())];

        info!(
            workcell_id = %manifest.workcell_id,
            issue_id = %manifest.issue.id,
            script = %script.display(),
            "Executing Blender"
        );

        match run_tool(&argv, workcell_path, timeout, None, &env).await {
            ToolRunOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                let log_paths = save_logs(workcell_path, self.name(), &stdout, &stderr);
                let tool_output = parse_trailing_json(&stdout);
                let mut proof = finish_proof(
                    manifest,
                    workcell_path,
                    self.name(),
                    "blender",
                    exit_code,
                    tool_output.as_ref(),
                    started_at,
                    started,
                    log_paths,
                );

                // A clean exit without an exported asset is only a
                // partial result; the fab gate needs a file to judge.
                if proof.status == ProofStatus::Success
                    && find_asset_file(workcell_path).is_none()
                {
                    warn!(
                        workcell_id = %manifest.workcell_id,
                        "Blender exited cleanly but produced no asset"
                    );
                    proof.status = ProofStatus::Partial;
                    proof.set_confidence(0.4);
                    if proof.persist(workcell_path).is_err() {
                        warn!("Failed to re-persist downgraded proof");
                    }
                }

                proof
            }
            ToolRunOutcome::TimedOut => {
                error!(
                    workcell_id = %manifest.workcell_id,
                    timeout_secs = timeout.as_secs(),
                    "Blender execution timed out"
                );
                timeout_proof(manifest, workcell_path, self.name(), started_at, started)
            }
            ToolRunOutcome::LaunchFailed(e) => {
                error!(workcell_id = %manifest.workcell_id, error = %e, "Blender execution failed");
                error_proof(manifest, workcell_path, self.name(), started_at, started, e)
            }
        }
    }

    fn estimate_cost(&self, manifest: &Manifest) -> CostEstimate {
        CostEstimate {
            estimated_tokens: estimated_tokens(manifest),
            // Local render compute only.
            estimated_cost_usd: 0.0,
            model: "blender".to_string(),
        }
    }
}
