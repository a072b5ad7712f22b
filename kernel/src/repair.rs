//! Repair synthesis from failed fab gates.
//!
//! Two outputs, used for different issue flows:
//! - inline repair hints rewritten into the failing issue's description
//!   between the autogen markers, so the next attempt sees concrete
//!   guidance;
//! - standalone child repair issues built from a fail-code playbook,
//!   when a gate verdict asks for a dedicated repair task.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::proof::NextAction;
use crate::state::Priority;

pub const REPAIR_START_MARKER: &str = "<!-- AUTOGEN_REPAIR -->";
pub const REPAIR_END_MARKER: &str = "<!-- /AUTOGEN_REPAIR -->";

/// Cap on hint lines per gate; gates can emit long critic tails.
const MAX_ACTIONS_PER_GATE: usize = 12;

/// Rewrite the autogen repair block inside an issue description.
///
/// Any existing block between the markers is replaced, never appended
/// to, so repeated failures keep exactly one region.
pub fn inject_repair_hints(
    description: &str,
    failing_gates: &[(String, Vec<NextAction>)],
    attempt: u32,
) -> String {
    let base = strip_repair_block(description);

    if failing_gates.is_empty() {
        return base;
    }

    let mut lines: Vec<String> = Vec::new();
    lines.push(REPAIR_START_MARKER.to_string());
    lines.push(format!("## Repair Hints (Attempt {attempt})"));
    lines.push("Generated from the most recent failed fab gate run.".to_string());
    lines.push(String::new());

    for (gate_name, actions) in failing_gates {
        lines.push(format!("### {gate_name}"));
        for action in actions.iter().take(MAX_ACTIONS_PER_GATE) {
            let instructions = if action.instructions.trim().is_empty() {
                format!("Fix {}", action.fail_code)
            } else {
                action.instructions.trim().to_string()
            };
            lines.push(format!(
                "- [P{}] {}: {}",
                action.priority, action.fail_code, instructions
            ));
        }
        lines.push(String::new());
    }

    lines.push(REPAIR_END_MARKER.to_string());

    if base.is_empty() {
        lines.join("\n")
    } else {
        format!("{base}\n\n{}", lines.join("\n"))
    }
}

/// Remove an existing autogen block, returning the trimmed remainder.
pub fn strip_repair_block(description: &str) -> String {
    let Some(start) = description.find(REPAIR_START_MARKER) else {
        return description.trim().to_string();
    };
    let Some(end) = description[start..].find(REPAIR_END_MARKER) else {
        warn!("Unterminated repair block in issue description; leaving it in place");
        return description.trim().to_string();
    };
    let after = start + end + REPAIR_END_MARKER.len();
    format!("{}{}", &description[..start], &description[after..])
        .trim()
        .to_string()
}

/// One playbook entry: how to repair a known fail code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookEntry {
    /// 1 = must fix, 2 = important, 3+ = minor.
    #[serde(default = "default_playbook_priority")]
    pub priority: u32,
    pub instructions: String,
}

fn default_playbook_priority() -> u32 {
    3
}

/// Fail-code → repair instruction mapping plus the hard-fail set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairPlaybook {
    #[serde(default)]
    pub entries: BTreeMap<String, PlaybookEntry>,
    #[serde(default)]
    pub hard_fail_codes: BTreeSet<String>,
}

impl RepairPlaybook {
    pub fn entry(&self, fail_code: &str) -> Option<&PlaybookEntry> {
        self.entries.get(fail_code)
    }

    pub fn is_hard_fail(&self, fail_code: &str) -> bool {
        self.hard_fail_codes.contains(fail_code)
    }
}

/// A synthesized child repair issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairIssue {
    pub title: String,
    pub description: String,
    pub parent_issue_id: String,
    pub iteration_index: u32,
    pub fail_codes: Vec<String>,
    pub priority: Priority,
    pub tags: Vec<String>,
}

/// Build a repair issue from a gate failure.
///
/// Fail codes are grouped into priority sections from the playbook;
/// the score summary marks each subscore ✓ at 0.6 and above. Priority
/// is the minimum playbook priority, clamped to 1 when a hard fail is
/// present.
pub fn build_repair_issue(
    playbook: &RepairPlaybook,
    original_issue_id: &str,
    original_title: &str,
    iteration: u32,
    fail_codes: &[String],
    scores: &BTreeMap<String, f64>,
    render_paths: &[String],
) -> RepairIssue {
    let mut high = Vec::new();
    let mut medium = Vec::new();
    let mut low = Vec::new();

    for code in fail_codes {
        let (priority, instructions) = match playbook.entry(code) {
            Some(entry) => (entry.priority, entry.instructions.clone()),
            None => (default_playbook_priority(), format!("Fix {code}")),
        };
        let item = (code.clone(), instructions);
        match priority {
            1 => high.push(item),
            2 => medium.push(item),
            _ => low.push(item),
        }
    }

    let mut sections: Vec<String> = Vec::new();
    sections.push(format!(
        "**Repair iteration {} for issue #{original_issue_id}**\n",
        iteration + 1
    ));
    sections.push(format!(
        "The previous attempt failed gate evaluation.\n\n**Failure codes:** {}\n",
        fail_codes.join(", ")
    ));

    for (heading, items) in [
        ("## Critical Issues (Must Fix)", &high),
        ("## Important Issues", &medium),
        ("## Minor Issues", &low),
    ] {
        if items.is_empty() {
            continue;
        }
        sections.push(heading.to_string());
        for (code, instructions) in items {
            sections.push(format!("### {code}\n{instructions}"));
        }
    }

    sections.push("## Current Scores".to_string());
    for (critic, score) in scores {
        let status = if *score >= 0.6 { "✓" } else { "✗" };
        sections.push(format!("- {critic}: {score:.2} {status}"));
    }

    if !render_paths.is_empty() {
        sections.push("## Reference Renders".to_string());
        for path in render_paths.iter().take(5) {
            sections.push(format!("- `{path}`"));
        }
    }

    let priority = repair_priority(playbook, fail_codes);

    RepairIssue {
        title: format!("[REPAIR {iteration}] {original_title}"),
        description: sections.join("\n\n"),
        parent_issue_id: original_issue_id.to_string(),
        iteration_index: iteration,
        fail_codes: fail_codes.to_vec(),
        priority,
        tags: vec![
            "repair".to_string(),
            "asset".to_string(),
            format!("iteration:{iteration}"),
        ],
    }
}

/// Minimum playbook priority across the fail codes, clamped to 1 when
/// any hard fail is present. Mapped onto the issue priority scale.
fn repair_priority(playbook: &RepairPlaybook, fail_codes: &[String]) -> Priority {
    let mut min_priority = u32::MAX;
    for code in fail_codes {
        let p = playbook
            .entry(code)
            .map(|e| e.priority)
            .unwrap_or_else(default_playbook_priority);
        min_priority = min_priority.min(p);
    }
    if fail_codes.iter().any(|c| playbook.is_hard_fail(c)) {
        min_priority = 1;
    }

    match min_priority {
        0 | 1 => Priority::P0,
        2 => Priority::P1,
        3 => Priority::P2,
        _ => Priority::P3,
    }
}
