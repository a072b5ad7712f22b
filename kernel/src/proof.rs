//! Proof records — the per-task output document of a workcell.
//!
//! Produced by a toolchain adapter, mutated only by the verifier (which
//! fills in the verification block), then persisted next to the manifest
//! as `<workcell>/proof.json`. Field names are snake_case, timestamps
//! ISO-8601 UTC with a `Z` suffix.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::Risk;

pub const PROOF_SCHEMA_VERSION: &str = "1.0.0";
pub const PROOF_FILE: &str = "proof.json";

/// Terminal status of an adapter execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Success,
    Partial,
    Failed,
    Timeout,
    Error,
}

impl ProofStatus {
    /// A dispatch counts as successful when the adapter finished the task,
    /// even partially — gates decide the rest.
    pub fn is_dispatch_success(self) -> bool {
        matches!(self, ProofStatus::Success | ProofStatus::Partial)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u64,
    pub insertions: u64,
    pub deletions: u64,
}

impl DiffStats {
    pub fn total_lines(&self) -> u64 {
        self.insertions + self.deletions
    }
}

/// The patch block: what the workcell changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchSummary {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default)]
    pub head_commit: String,
    #[serde(default)]
    pub diff_stats: DiffStats,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub forbidden_path_violations: Vec<String>,
}

/// Structured verdict from a fab gate; overrides the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Escalate,
}

/// A repair hint emitted by a failing fab gate. Priority 1 is the most
/// urgent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextAction {
    #[serde(default = "default_action_priority")]
    pub priority: u32,
    #[serde(default)]
    pub fail_code: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_action_priority() -> u32 {
    3
}

/// Result of executing one quality gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_actions: Vec<NextAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl GateResult {
    /// Counts toward `all_passed` when passed or deliberately skipped.
    pub fn is_green(&self) -> bool {
        self.passed || self.skipped
    }
}

/// The verification block, owned by the verifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub gates: BTreeMap<String, GateResult>,
    #[serde(default)]
    pub all_passed: bool,
    #[serde(default)]
    pub blocking_failures: Vec<String>,
}

/// Execution metadata filled in by the adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProofMetadata {
    #[serde(default)]
    pub toolchain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub completed_at: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// One external command launched inside the workcell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
}

/// The full proof document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub schema_version: String,
    pub workcell_id: String,
    pub issue_id: String,
    pub status: ProofStatus,
    #[serde(default)]
    pub patch: PatchSummary,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default)]
    pub metadata: ProofMetadata,
    #[serde(default)]
    pub commands_executed: Vec<CommandRecord>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub risk_classification: Risk,
}

impl Proof {
    pub fn new(workcell_id: impl Into<String>, issue_id: impl Into<String>, status: ProofStatus) -> Self {
        Self {
            schema_version: PROOF_SCHEMA_VERSION.to_string(),
            workcell_id: workcell_id.into(),
            issue_id: issue_id.into(),
            status,
            patch: PatchSummary::default(),
            verification: Verification::default(),
            metadata: ProofMetadata::default(),
            commands_executed: Vec::new(),
            confidence: 0.0,
            risk_classification: Risk::default(),
        }
    }

    /// Set confidence, clamped to `[0, 1]`.
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    /// Failing fab gates that carry repair hints, in gate-name order.
    pub fn failing_gates_with_actions(&self) -> Vec<(&str, &[NextAction])> {
        self.verification
            .gates
            .iter()
            .filter(|(_, g)| !g.passed && !g.skipped && !g.next_actions.is_empty())
            .map(|(name, g)| (name.as_str(), g.next_actions.as_slice()))
            .collect()
    }

    /// Persist the proof next to the manifest.
    pub fn persist(&self, workcell_path: &Path) -> std::io::Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(workcell_path.join(PROOF_FILE), contents)
    }

    pub fn load(workcell_path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(workcell_path.join(PROOF_FILE))?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
