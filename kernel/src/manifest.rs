//! Task manifests — the per-task input document written to a workcell.
//!
//! Exactly one manifest exists per workcell and it is immutable once
//! written. Gate selection is driven by issue tags; all tag-prefix
//! parsing is centralized in [`RoutingHints`] so new gate types don't
//! scatter string matching.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::GateCommands;
use crate::state::Issue;

pub const MANIFEST_SCHEMA_VERSION: &str = "1.0.0";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Structured view of an issue's routing tags.
///
/// - `asset:<category>` selects an asset category (first one wins)
/// - `gate:config:<id>` / `gate:godot-config:<id>` override gate config ids
/// - every other `gate:<flag>` lands in `flags` (`godot`, `engine`,
///   `asset-only`, `realism`, ...)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingHints {
    pub category: Option<String>,
    pub gate_overrides: HashMap<String, String>,
    pub flags: HashSet<String>,
}

impl RoutingHints {
    pub fn parse(tags: &[String]) -> Self {
        let mut hints = RoutingHints::default();
        for tag in tags {
            if let Some(category) = tag.strip_prefix("asset:") {
                if hints.category.is_none() && !category.is_empty() {
                    hints.category = Some(category.to_string());
                }
            } else if let Some(id) = tag.strip_prefix("gate:config:") {
                hints
                    .gate_overrides
                    .insert("fab-realism".to_string(), id.to_string());
            } else if let Some(id) = tag.strip_prefix("gate:godot-config:") {
                hints
                    .gate_overrides
                    .insert("fab-godot".to_string(), id.to_string());
            } else if let Some(flag) = tag.strip_prefix("gate:") {
                hints.flags.insert(flag.to_string());
            }
        }
        hints
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Does this issue want a fab-realism gate at all?
    pub fn wants_realism_gate(&self) -> bool {
        self.category.is_some() || self.has_flag("realism")
    }

    pub fn wants_godot_gate(&self) -> bool {
        self.has_flag("godot") || self.has_flag("engine")
    }
}

/// Parameters of a structured fab gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FabGateSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_config_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<String>,
    /// Explicit command override; when unset the verifier derives one
    /// from `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// A quality gate definition inside `manifest.quality_gates`.
///
/// Code gates are bare command strings; fab gates are structured records
/// discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GateDefinition {
    Command(String),
    Fab(FabGateSpec),
}

impl GateDefinition {
    pub fn is_fab(&self) -> bool {
        matches!(self, GateDefinition::Fab(_))
    }

    pub fn as_command(&self) -> Option<&str> {
        match self {
            GateDefinition::Command(cmd) => Some(cmd),
            GateDefinition::Fab(_) => None,
        }
    }

    pub fn as_fab(&self) -> Option<&FabGateSpec> {
        match self {
            GateDefinition::Fab(spec) => Some(spec),
            GateDefinition::Command(_) => None,
        }
    }
}

/// Derive the quality-gate map for an issue from its tags.
///
/// Default code gates come from config. `asset:` tags add a fab-realism
/// gate, `gate:godot`/`gate:engine` adds fab-godot, and `gate:asset-only`
/// strips the code gates.
pub fn build_quality_gates(
    tags: &[String],
    defaults: &GateCommands,
) -> BTreeMap<String, GateDefinition> {
    let hints = RoutingHints::parse(tags);

    let mut gates = BTreeMap::new();
    gates.insert(
        "test".to_string(),
        GateDefinition::Command(defaults.test_command.clone()),
    );
    gates.insert(
        "typecheck".to_string(),
        GateDefinition::Command(defaults.typecheck_command.clone()),
    );
    gates.insert(
        "lint".to_string(),
        GateDefinition::Command(defaults.lint_command.clone()),
    );

    if hints.wants_realism_gate() {
        let category = hints.category.clone().unwrap_or_else(|| "car".to_string());
        let gate_config_id = hints
            .gate_overrides
            .get("fab-realism")
            .cloned()
            .unwrap_or_else(|| format!("{category}_realism_v001"));

        gates.insert(
            "fab-realism".to_string(),
            GateDefinition::Fab(FabGateSpec {
                kind: "fab-realism".to_string(),
                category: Some(category),
                gate_config_id: Some(gate_config_id),
                template_dir: None,
                command: None,
            }),
        );

        if hints.wants_godot_gate() {
            let godot_config_id = hints
                .gate_overrides
                .get("fab-godot")
                .cloned()
                .unwrap_or_else(|| "godot_integration_v001".to_string());

            gates.insert(
                "fab-godot".to_string(),
                GateDefinition::Fab(FabGateSpec {
                    kind: "fab-godot".to_string(),
                    category: None,
                    gate_config_id: Some(godot_config_id),
                    // Workcell-relative path, so monorepo tasks resolve it.
                    template_dir: Some("fab/godot/template".to_string()),
                    command: None,
                }),
            );
        }

        if hints.has_flag("asset-only") {
            gates.remove("test");
            gates.remove("typecheck");
            gates.remove("lint");
        }
    }

    gates
}

/// Snapshot of the issue embedded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIssue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub estimated_tokens: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&Issue> for ManifestIssue {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id.clone(),
            title: issue.title.clone(),
            description: issue.description.clone(),
            acceptance_criteria: issue.acceptance_criteria.clone(),
            context_files: issue.context_files.clone(),
            forbidden_paths: issue.forbidden_paths.clone(),
            estimated_tokens: issue.estimated_tokens,
            tags: issue.tags.clone(),
        }
    }
}

/// Toolchain-specific configuration embedded in the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestToolchainConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The per-task manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub workcell_id: String,
    pub branch_name: String,
    pub issue: ManifestIssue,
    pub toolchain: String,
    #[serde(default)]
    pub toolchain_config: ManifestToolchainConfig,
    #[serde(default)]
    pub quality_gates: BTreeMap<String, GateDefinition>,
    #[serde(default)]
    pub speculate_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speculate_tag: Option<String>,
}

impl Manifest {
    pub fn build(
        issue: &Issue,
        workcell_id: &str,
        toolchain: &str,
        model: Option<String>,
        speculate_tag: Option<String>,
        quality_gates: BTreeMap<String, GateDefinition>,
    ) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            workcell_id: workcell_id.to_string(),
            branch_name: format!("wc/{}/{}", issue.id, workcell_id),
            issue: ManifestIssue::from(issue),
            toolchain: toolchain.to_string(),
            toolchain_config: ManifestToolchainConfig { model },
            quality_gates,
            speculate_mode: speculate_tag.is_some(),
            speculate_tag,
        }
    }

    /// Code gates: name → command string.
    pub fn code_gates(&self) -> BTreeMap<String, String> {
        self.quality_gates
            .iter()
            .filter_map(|(name, def)| def.as_command().map(|c| (name.clone(), c.to_string())))
            .collect()
    }

    /// Fab gates: name → spec, in name order.
    pub fn fab_gates(&self) -> Vec<(String, FabGateSpec)> {
        self.quality_gates
            .iter()
            .filter_map(|(name, def)| def.as_fab().map(|s| (name.clone(), s.clone())))
            .collect()
    }

    /// Write the manifest into a workcell. Fails if one was already
    /// written — manifests are immutable.
    pub fn write_to(&self, workcell_path: &Path) -> std::io::Result<()> {
        let path = workcell_path.join(MANIFEST_FILE);
        if let Ok(existing) = std::fs::read_to_string(&path) {
            if !existing.trim().is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("manifest already written at {}", path.display()),
                ));
            }
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, contents)
    }

    pub fn load(workcell_path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(workcell_path.join(MANIFEST_FILE))?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_routing_hints_parse() {
        let hints = RoutingHints::parse(&tags(&[
            "asset:car",
            "gate:godot",
            "gate:config:custom_v002",
            "unrelated",
        ]));
        assert_eq!(hints.category.as_deref(), Some("car"));
        assert!(hints.wants_godot_gate());
        assert_eq!(
            hints.gate_overrides.get("fab-realism").map(String::as_str),
            Some("custom_v002")
        );
        assert!(!hints.has_flag("asset-only"));
    }

    #[test]
    fn test_default_gates_for_plain_issue() {
        let gates = build_quality_gates(&tags(&["backend"]), &GateCommands::default());
        assert_eq!(gates.len(), 3);
        assert!(gates.contains_key("test"));
        assert!(gates.contains_key("typecheck"));
        assert!(gates.contains_key("lint"));
        assert!(gates.values().all(|g| !g.is_fab()));
    }

    #[test]
    fn test_asset_tag_adds_realism_gate() {
        let gates = build_quality_gates(&tags(&["asset:car"]), &GateCommands::default());
        assert_eq!(gates.len(), 4);
        let fab = gates["fab-realism"].as_fab().expect("fab gate");
        assert_eq!(fab.category.as_deref(), Some("car"));
        assert_eq!(fab.gate_config_id.as_deref(), Some("car_realism_v001"));
    }

    #[test]
    fn test_gate_config_override() {
        let gates = build_quality_gates(
            &tags(&["asset:lamp", "gate:config:lamp_strict_v003"]),
            &GateCommands::default(),
        );
        let fab = gates["fab-realism"].as_fab().unwrap();
        assert_eq!(fab.gate_config_id.as_deref(), Some("lamp_strict_v003"));
    }

    #[test]
    fn test_godot_gate_added_for_engine_flag() {
        let gates =
            build_quality_gates(&tags(&["asset:car", "gate:engine"]), &GateCommands::default());
        let godot = gates["fab-godot"].as_fab().unwrap();
        assert_eq!(godot.gate_config_id.as_deref(), Some("godot_integration_v001"));
        assert_eq!(godot.template_dir.as_deref(), Some("fab/godot/template"));
    }

    #[test]
    fn test_asset_only_strips_code_gates() {
        let gates = build_quality_gates(
            &tags(&["asset:car", "gate:godot", "gate:asset-only"]),
            &GateCommands::default(),
        );
        assert!(!gates.contains_key("test"));
        assert!(!gates.contains_key("typecheck"));
        assert!(!gates.contains_key("lint"));
        assert!(gates.contains_key("fab-realism"));
        assert!(gates.contains_key("fab-godot"));
    }

    #[test]
    fn test_gate_definition_untagged_serde() {
        let gates = build_quality_gates(&tags(&["asset:car"]), &GateCommands::default());
        let json = serde_json::to_string(&gates).unwrap();
        let back: BTreeMap<String, GateDefinition> = serde_json::from_str(&json).unwrap();
        assert_eq!(back["test"].as_command(), Some("cargo test"));
        assert!(back["fab-realism"].is_fab());
    }

    #[test]
    fn test_manifest_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let issue = Issue::new("9", "Model a car");
        let manifest = Manifest::build(
            &issue,
            "wc-9-abc123",
            "claude",
            Some("claude-sonnet-4-20250514".into()),
            None,
            build_quality_gates(&issue.tags, &GateCommands::default()),
        );

        manifest.write_to(dir.path()).unwrap();
        let err = manifest.write_to(dir.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.branch_name, "wc/9/wc-9-abc123");
        assert_eq!(loaded.schema_version, MANIFEST_SCHEMA_VERSION);
    }

    #[test]
    fn test_write_over_empty_slot_allowed() {
        // Workcell creation seeds an empty manifest.json slot.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "").unwrap();

        let issue = Issue::new("3", "Fix parser");
        let manifest = Manifest::build(
            &issue,
            "wc-3-x",
            "codex",
            None,
            Some("spec-codex".into()),
            BTreeMap::new(),
        );
        manifest.write_to(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert!(loaded.speculate_mode);
        assert_eq!(loaded.speculate_tag.as_deref(), Some("spec-codex"));
    }

    #[test]
    fn test_unknown_fields_tolerated_on_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{
                "schema_version": "1.0.0",
                "workcell_id": "wc-1-a",
                "branch_name": "wc/1/wc-1-a",
                "issue": {"id": "1", "title": "t"},
                "toolchain": "claude",
                "future_field": {"nested": true}
            }"#,
        )
        .unwrap();

        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.workcell_id, "wc-1-a");
        assert!(manifest.quality_gates.is_empty());
    }
}
