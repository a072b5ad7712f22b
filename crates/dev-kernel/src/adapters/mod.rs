//! Toolchain adapters: a uniform contract over external coding agents.
//!
//! Each adapter binds the [`ToolchainAdapter`] trait to one CLI binary
//! (claude, codex, opencode, blender). Adapters never raise for domain
//! failures: timeouts and crashes come back as proofs with status
//! `timeout`/`error`. Availability is probed once at construction and
//! cached; missing binaries are routed around by the dispatcher.

mod blender;
mod claude;
mod codex;
mod exec;
mod opencode;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kernel::{Manifest, Proof, ToolchainConfig};

pub use blender::BlenderAdapter;
pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use exec::{build_prompt, check_forbidden_paths, classify_risk};
pub use opencode::OpenCodeAdapter;

/// Predicted resource usage for a task on a given adapter.
#[derive(Debug, Clone)]
pub struct CostEstimate {
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    pub model: String,
}

/// The capability set every toolchain binding implements.
#[async_trait]
pub trait ToolchainAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Probed once at startup; a missing binary is silently skipped by
    /// the dispatcher.
    fn available(&self) -> bool;

    /// Cheap liveness probe (typically `<tool> --version`).
    async fn health_check(&self) -> bool;

    /// Run the task described by the manifest inside the workcell.
    ///
    /// Must never return an error: timeouts and crashes become proofs
    /// with status `timeout` / `error`, persisted to the workcell
    /// before returning.
    async fn execute(&self, manifest: &Manifest, workcell_path: &Path, timeout: Duration) -> Proof;

    fn estimate_cost(&self, manifest: &Manifest) -> CostEstimate;
}

/// Construct an adapter by its registry name.
pub fn build_adapter(name: &str, config: &ToolchainConfig) -> Option<Arc<dyn ToolchainAdapter>> {
    match name {
        "claude" => Some(Arc::new(ClaudeAdapter::new(config))),
        "codex" => Some(Arc::new(CodexAdapter::new(config))),
        "opencode" => Some(Arc::new(OpenCodeAdapter::new(config))),
        "blender" => Some(Arc::new(BlenderAdapter::new(config))),
        _ => None,
    }
}

/// Token-count estimate shared by the adapters; the issue's estimate is
/// the best signal the kernel has.
fn estimated_tokens(manifest: &Manifest) -> u64 {
    if manifest.issue.estimated_tokens > 0 {
        manifest.issue.estimated_tokens
    } else {
        50_000
    }
}
