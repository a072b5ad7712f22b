//! Dispatcher — manifest construction, toolchain routing, execution.
//!
//! Routes each admitted issue to exactly one adapter (single dispatch)
//! or to several in parallel (speculate dispatch). The manifest is
//! deterministic given the issue and config; the adapter does the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use kernel::{build_quality_gates, Issue, KernelConfig, Manifest, Proof};
use tracing::{error, info, warn};

use crate::adapters::{build_adapter, ToolchainAdapter};

/// Result of dispatching one workcell.
#[derive(Debug)]
pub struct DispatchResult {
    /// Did the adapter finish the task (status success/partial)?
    pub success: bool,
    pub proof: Option<Proof>,
    pub workcell_id: String,
    pub issue_id: String,
    pub toolchain: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub speculate_tag: Option<String>,
}

impl DispatchResult {
    fn failed(
        workcell_id: &str,
        issue_id: &str,
        toolchain: &str,
        error: String,
        speculate_tag: Option<String>,
    ) -> Self {
        Self {
            success: false,
            proof: None,
            workcell_id: workcell_id.to_string(),
            issue_id: issue_id.to_string(),
            toolchain: toolchain.to_string(),
            duration_ms: 0,
            error: Some(error),
            speculate_tag,
        }
    }
}

pub struct Dispatcher {
    config: KernelConfig,
    adapters: Vec<Arc<dyn ToolchainAdapter>>,
}

impl Dispatcher {
    /// Build adapters for every configured toolchain, in priority order.
    pub fn new(config: KernelConfig) -> Self {
        let mut adapters = Vec::new();
        for name in &config.toolchain_priority {
            match build_adapter(name, &config.toolchain(name)) {
                Some(adapter) => {
                    info!(name = %name, available = adapter.available(), "Adapter initialized");
                    adapters.push(adapter);
                }
                None => warn!(name = %name, "Unknown toolchain in priority list"),
            }
        }
        Self { config, adapters }
    }

    /// Inject adapters directly; the seam tests and embedders use.
    pub fn with_adapters(config: KernelConfig, adapters: Vec<Arc<dyn ToolchainAdapter>>) -> Self {
        Self { config, adapters }
    }

    /// Names of adapters whose binaries are present.
    pub fn available_toolchains(&self) -> Vec<String> {
        self.adapters
            .iter()
            .filter(|a| a.available())
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Probe every available adapter's health concurrently. Returns
    /// `(name, healthy)` pairs in priority order.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let probes = self.adapters.iter().filter(|a| a.available()).map(|a| {
            let name = a.name().to_string();
            let adapter = a.clone();
            async move { (name, adapter.health_check().await) }
        });
        join_all(probes).await
    }

    /// Candidate toolchains for a speculate dispatch: the issue's hint
    /// first when available, then the remaining priority order.
    pub fn speculate_candidates(&self, issue: &Issue) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(hint) = &issue.tool_hint {
            if self
                .adapters
                .iter()
                .any(|a| a.name() == hint && a.available())
            {
                candidates.push(hint.clone());
            }
        }
        for adapter in &self.adapters {
            let name = adapter.name().to_string();
            if adapter.available() && !candidates.contains(&name) {
                candidates.push(name);
            }
        }
        candidates
    }

    /// Route an issue to its adapter: honor an available tool hint,
    /// else first available in priority order.
    fn route(&self, issue: &Issue) -> Option<Arc<dyn ToolchainAdapter>> {
        if let Some(hint) = &issue.tool_hint {
            if let Some(adapter) = self
                .adapters
                .iter()
                .find(|a| a.name() == hint && a.available())
            {
                return Some(adapter.clone());
            }
        }
        self.adapters.iter().find(|a| a.available()).cloned()
    }

    fn adapter_by_name(&self, name: &str) -> Option<Arc<dyn ToolchainAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    /// Build the manifest for one workcell. Deterministic given the
    /// issue and config.
    pub fn build_manifest(
        &self,
        issue: &Issue,
        workcell_id: &str,
        toolchain: &str,
        speculate_tag: Option<String>,
    ) -> Manifest {
        let gates = build_quality_gates(&issue.tags, &self.config.gates);
        let model = self.config.toolchain(toolchain).model;
        Manifest::build(issue, workcell_id, toolchain, model, speculate_tag, gates)
    }

    /// Dispatch one workcell: write the manifest, invoke the adapter,
    /// return the result with its proof.
    pub async fn dispatch(
        &self,
        issue: &Issue,
        workcell_path: &Path,
        speculate_tag: Option<String>,
        toolchain_override: Option<&str>,
    ) -> DispatchResult {
        let started = Instant::now();
        let workcell_id = workcell_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let adapter = match toolchain_override {
            Some(name) => self.adapter_by_name(name),
            None => self.route(issue),
        };
        let Some(adapter) = adapter else {
            error!(issue_id = %issue.id, "No adapter available");
            return DispatchResult::failed(
                &workcell_id,
                &issue.id,
                toolchain_override.unwrap_or("none"),
                "no_adapter_available".to_string(),
                speculate_tag,
            );
        };
        let toolchain = adapter.name().to_string();

        let manifest = self.build_manifest(issue, &workcell_id, &toolchain, speculate_tag.clone());
        if let Err(e) = manifest.write_to(workcell_path) {
            error!(issue_id = %issue.id, error = %e, "Failed to write manifest");
            return DispatchResult::failed(
                &workcell_id,
                &issue.id,
                &toolchain,
                format!("failed to write manifest: {e}"),
                speculate_tag,
            );
        }

        info!(
            issue_id = %issue.id,
            toolchain = %toolchain,
            workcell = %workcell_id,
            speculate = ?speculate_tag,
            "Dispatching to toolchain"
        );

        let timeout = self.config.toolchain_timeout(&toolchain);
        let proof = adapter.execute(&manifest, workcell_path, timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let success = proof.status.is_dispatch_success();

        info!(
            issue_id = %issue.id,
            status = ?proof.status,
            duration_ms,
            "Dispatch completed"
        );

        DispatchResult {
            success,
            error: proof.metadata.error.clone(),
            proof: Some(proof),
            workcell_id,
            issue_id: issue.id.clone(),
            toolchain,
            duration_ms,
            speculate_tag,
        }
    }

    /// Launch every speculate candidate concurrently and wait for all
    /// of them. No early-stop: the verifier needs every candidate's
    /// proof for voting.
    pub async fn dispatch_speculate(
        &self,
        issue: &Issue,
        workcells: &[(String, String, PathBuf)],
    ) -> Vec<DispatchResult> {
        info!(
            issue_id = %issue.id,
            parallelism = workcells.len(),
            "Dispatching speculate candidates"
        );

        let tasks = workcells.iter().map(|(toolchain, tag, path)| {
            self.dispatch(issue, path, Some(tag.clone()), Some(toolchain))
        });
        join_all(tasks).await
    }
}
