//! Verifier — manifest-driven gate execution and candidate scoring.
//!
//! Runs a workcell's quality gates and updates the proof's verification
//! block in place. Gate failures are normal outcomes, not errors; the
//! only short-circuit is a forbidden-path violation, which rejects the
//! proof before any gate runs.

mod fab;
mod gates;
pub mod voting;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::GateCommands;
use crate::manifest::{build_quality_gates, FabGateSpec, GateDefinition, Manifest};
use crate::proof::{GateResult, Proof};

pub use fab::{find_asset_file, FabGateRunner};
pub use gates::GateRunner;
pub use voting::{score_candidate, vote};

/// Name reported in `blocking_failures` for the forbidden-path
/// short-circuit.
pub const FORBIDDEN_PATHS_FAILURE: &str = "forbidden_paths";

pub struct Verifier {
    defaults: GateCommands,
}

impl Verifier {
    pub fn new(defaults: GateCommands) -> Self {
        Self { defaults }
    }

    /// Verify a workcell's output. Returns `true` when every gate passed
    /// (or was deliberately skipped).
    pub async fn verify(&self, proof: &mut Proof, workcell_path: &Path) -> bool {
        let workcell_id = proof.workcell_id.clone();

        // Forbidden paths reject outright; gates never run.
        if !proof.patch.forbidden_path_violations.is_empty() {
            warn!(
                workcell_id = %workcell_id,
                violations = ?proof.patch.forbidden_path_violations,
                "Forbidden path violations — rejecting without running gates"
            );
            proof.verification.all_passed = false;
            proof.verification.blocking_failures = vec![FORBIDDEN_PATHS_FAILURE.to_string()];
            self.persist(proof, workcell_path);
            return false;
        }

        // Adapter may have pre-verified (e.g. replayed proof).
        if proof.verification.all_passed {
            debug!(workcell_id = %workcell_id, "Proof already verified");
            return true;
        }

        let gates = self.load_gates(workcell_path);
        let (code_gates, fab_gates) = partition_gates(&gates);

        let mut results: BTreeMap<String, GateResult> = BTreeMap::new();

        if !code_gates.is_empty() {
            let runner = GateRunner::new(
                workcell_path,
                workcell_path.join("logs").join("gates"),
                Duration::from_secs(self.defaults.gate_timeout_seconds),
            );
            results.extend(runner.run_all(&code_gates).await);
        }

        // Fab gates run after code gates: realism-style gates first,
        // engine integration (fab-godot) last, and only when no upstream
        // fab gate failed.
        let fab_runner = FabGateRunner::new(
            workcell_path,
            Duration::from_secs(self.defaults.gate_timeout_seconds),
        );

        let mut godot_gate: Option<(String, FabGateSpec)> = None;
        let mut upstream_fab_failed = false;
        for (name, spec) in fab_gates {
            if name == "fab-godot" {
                godot_gate = Some((name, spec));
                continue;
            }
            let result = fab_runner.run(&name, &spec).await;
            if !result.is_green() {
                upstream_fab_failed = true;
            }
            results.insert(name, result);
        }

        if let Some((name, spec)) = godot_gate {
            let result = if upstream_fab_failed {
                GateResult {
                    passed: true,
                    skipped: true,
                    reason: Some("upstream fab gate failed".to_string()),
                    ..Default::default()
                }
            } else {
                fab_runner.run(&name, &spec).await
            };
            results.insert(name, result);
        }

        let all_passed = results.values().all(|r| r.is_green());
        let blocking_failures: Vec<String> = results
            .iter()
            .filter(|(_, r)| !r.is_green())
            .map(|(name, _)| name.clone())
            .collect();

        if !all_passed {
            warn!(
                workcell_id = %workcell_id,
                failures = ?blocking_failures,
                "Gate failures"
            );
        } else {
            info!(workcell_id = %workcell_id, gates = results.len(), "All gates passed");
        }

        proof.verification.gates = results;
        proof.verification.all_passed = all_passed;
        proof.verification.blocking_failures = blocking_failures;
        self.persist(proof, workcell_path);

        all_passed
    }

    /// Gates come from the workcell manifest; config defaults cover
    /// workcells whose manifest is missing or unreadable.
    fn load_gates(&self, workcell_path: &Path) -> BTreeMap<String, GateDefinition> {
        match Manifest::load(workcell_path) {
            Ok(manifest) if !manifest.quality_gates.is_empty() => {
                debug!(
                    gates = ?manifest.quality_gates.keys().collect::<Vec<_>>(),
                    "Loaded gates from manifest"
                );
                manifest.quality_gates
            }
            Ok(_) => build_quality_gates(&[], &self.defaults),
            Err(e) => {
                warn!(error = %e, "Failed to load manifest; using default gates");
                build_quality_gates(&[], &self.defaults)
            }
        }
    }

    fn persist(&self, proof: &Proof, workcell_path: &Path) {
        if let Err(e) = proof.persist(workcell_path) {
            warn!(path = %workcell_path.display(), error = %e, "Failed to persist proof");
        }
    }
}

fn partition_gates(
    gates: &BTreeMap<String, GateDefinition>,
) -> (BTreeMap<String, String>, Vec<(String, FabGateSpec)>) {
    let mut code = BTreeMap::new();
    let mut fab = Vec::new();
    for (name, def) in gates {
        match def {
            GateDefinition::Command(cmd) => {
                code.insert(name.clone(), cmd.clone());
            }
            GateDefinition::Fab(spec) => fab.push((name.clone(), spec.clone())),
        }
    }
    (code, fab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofStatus;
    use crate::state::Risk;

    fn write_manifest_with_gates(dir: &Path, gates: &str) {
        std::fs::write(
            dir.join("manifest.json"),
            format!(
                r#"{{
                    "schema_version": "1.0.0",
                    "workcell_id": "wc-1-a",
                    "branch_name": "wc/1/wc-1-a",
                    "issue": {{"id": "1", "title": "t"}},
                    "toolchain": "claude",
                    "quality_gates": {gates}
                }}"#
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_forbidden_paths_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        // A gate that would fail loudly if it ever ran.
        write_manifest_with_gates(dir.path(), r#"{"test": "false"}"#);

        let mut proof = Proof::new("wc-1-a", "1", ProofStatus::Success);
        proof.patch.files_modified = vec![".github/workflows/deploy.yml".into()];
        proof.patch.forbidden_path_violations = vec![".github/workflows/deploy.yml".into()];
        proof.risk_classification = Risk::Critical;

        let verifier = Verifier::new(GateCommands::default());
        let passed = verifier.verify(&mut proof, dir.path()).await;

        assert!(!passed);
        assert!(proof.verification.gates.is_empty(), "no gates may run");
        assert_eq!(
            proof.verification.blocking_failures,
            vec![FORBIDDEN_PATHS_FAILURE.to_string()]
        );
        assert_eq!(proof.risk_classification, Risk::Critical);

        // Proof persisted with the rejection recorded.
        let reloaded = Proof::load(dir.path()).unwrap();
        assert!(!reloaded.verification.all_passed);
    }

    #[tokio::test]
    async fn test_pre_verified_proof_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut proof = Proof::new("wc-1-a", "1", ProofStatus::Success);
        proof.verification.all_passed = true;

        let verifier = Verifier::new(GateCommands::default());
        assert!(verifier.verify(&mut proof, dir.path()).await);
    }

    #[tokio::test]
    async fn test_code_gates_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest_with_gates(dir.path(), r#"{"test": "true", "lint": "false"}"#);

        let mut proof = Proof::new("wc-1-a", "1", ProofStatus::Success);
        let verifier = Verifier::new(GateCommands::default());
        let passed = verifier.verify(&mut proof, dir.path()).await;

        assert!(!passed);
        assert!(proof.verification.gates["test"].passed);
        assert!(!proof.verification.gates["lint"].passed);
        assert_eq!(proof.verification.blocking_failures, vec!["lint".to_string()]);
    }

    #[tokio::test]
    async fn test_all_green_aggregation_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest_with_gates(dir.path(), r#"{"test": "true", "typecheck": "true"}"#);

        let mut proof = Proof::new("wc-1-a", "1", ProofStatus::Success);
        let verifier = Verifier::new(GateCommands::default());
        assert!(verifier.verify(&mut proof, dir.path()).await);
        assert!(proof.verification.all_passed);

        let reloaded = Proof::load(dir.path()).unwrap();
        assert!(reloaded.verification.all_passed);
        assert!(reloaded.verification.blocking_failures.is_empty());
    }

    #[tokio::test]
    async fn test_godot_skipped_when_upstream_fab_fails() {
        let dir = tempfile::tempdir().unwrap();
        // fab-realism will fail (no asset file in the workcell), so
        // fab-godot must be skipped without executing.
        write_manifest_with_gates(
            dir.path(),
            r#"{
                "fab-realism": {"type": "fab-realism", "category": "car"},
                "fab-godot": {"type": "fab-godot"}
            }"#,
        );

        let mut proof = Proof::new("wc-1-a", "1", ProofStatus::Success);
        let verifier = Verifier::new(GateCommands::default());
        let passed = verifier.verify(&mut proof, dir.path()).await;

        assert!(!passed);
        let godot = &proof.verification.gates["fab-godot"];
        assert!(godot.skipped);
        assert!(godot.is_green());
        assert_eq!(godot.reason.as_deref(), Some("upstream fab gate failed"));
        // Only the realism gate blocks.
        assert_eq!(
            proof.verification.blocking_failures,
            vec!["fab-realism".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_manifest_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = GateCommands {
            test_command: "true".into(),
            typecheck_command: "true".into(),
            lint_command: "true".into(),
            gate_timeout_seconds: 60,
        };

        let mut proof = Proof::new("wc-1-a", "1", ProofStatus::Success);
        let verifier = Verifier::new(defaults);
        assert!(verifier.verify(&mut proof, dir.path()).await);
        assert_eq!(proof.verification.gates.len(), 3);
    }
}
