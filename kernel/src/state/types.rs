//! Issue, dependency, and graph types for the beads work graph.
//!
//! These mirror the on-disk beads schema (`issues.jsonl` / `deps.jsonl`):
//! kernel-private fields carry the `dk_` prefix so they round-trip through
//! stores that don't know about them. Unknown fields are tolerated on read.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Error type for graph data problems.
///
/// Cycle and schema errors are fatal for the cycle that hit them;
/// I/O errors are transient and retried on the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("blocks dependency cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("edge references missing issue {id}")]
    MissingIssue { id: String },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("graph store I/O error: {0}")]
    Io(String),
}

/// Issue lifecycle status. Closed set — stores must not invent new states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    Ready,
    Running,
    Done,
    Escalated,
    Blocked,
    Abandoned,
}

impl IssueStatus {
    /// Statuses eligible for scheduling (before blocker checks).
    pub fn is_workable(self) -> bool {
        matches!(self, IssueStatus::Open | IssueStatus::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::Ready => "ready",
            IssueStatus::Running => "running",
            IssueStatus::Done => "done",
            IssueStatus::Escalated => "escalated",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Abandoned => "abandoned",
        }
    }
}

/// Ordinal priority. `P0` is the most urgent; derived `Ord` follows
/// declaration order, so sorting ascending puts urgent work first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

/// Risk classification shared by issues and proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Risk {
    /// Higher rank = riskier. Used for scheduler tie-breaks.
    pub fn rank(self) -> u8 {
        match self {
            Risk::Low => 0,
            Risk::Medium => 1,
            Risk::High => 2,
            Risk::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Critical => "critical",
        }
    }
}

/// A unit of work stored in the beads graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,

    // Kernel-private fields, dk_-prefixed on disk.
    #[serde(rename = "dk_priority", default)]
    pub priority: Priority,
    #[serde(rename = "dk_risk", default)]
    pub risk: Risk,
    #[serde(rename = "dk_estimated_tokens", default = "default_estimated_tokens")]
    pub estimated_tokens: u64,
    #[serde(rename = "dk_attempts", default)]
    pub attempts: u32,
    #[serde(rename = "dk_max_attempts", default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "dk_parent", default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(
        rename = "dk_tool_hint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_hint: Option<String>,
    #[serde(rename = "dk_forbidden_paths", default)]
    pub forbidden_paths: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
}

fn default_estimated_tokens() -> u64 {
    50_000
}

fn default_max_attempts() -> u32 {
    3
}

impl Issue {
    /// Minimal constructor for tests and synthesized issues.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: IssueStatus::Open,
            acceptance_criteria: Vec::new(),
            tags: Vec::new(),
            context_files: Vec::new(),
            priority: Priority::default(),
            risk: Risk::default(),
            estimated_tokens: default_estimated_tokens(),
            attempts: 0,
            max_attempts: default_max_attempts(),
            parent: None,
            tool_hint: None,
            forbidden_paths: Vec::new(),
            created: None,
            updated: None,
        }
    }

    pub fn is_asset(&self) -> bool {
        self.tags.iter().any(|t| t.starts_with("asset:"))
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Dependency edge kind. Only `blocks` affects readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    #[default]
    Blocks,
    Related,
    ParentOf,
}

impl DepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DepKind::Blocks => "blocks",
            DepKind::Related => "related",
            DepKind::ParentOf => "parent-of",
        }
    }
}

/// A dependency edge: `from` is blocked by (or related to) `to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dep {
    pub from: String,
    pub to: String,
    #[serde(rename = "type", default)]
    pub kind: DepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// The full work graph: issues plus dependency edges.
#[derive(Debug, Clone, Default)]
pub struct BeadsGraph {
    pub issues: Vec<Issue>,
    pub deps: Vec<Dep>,
}

impl BeadsGraph {
    pub fn new(issues: Vec<Issue>, deps: Vec<Dep>) -> Self {
        Self { issues, deps }
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn get_issue(&self, id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.id == id)
    }

    /// Issues that must be `done` before `id` is ready.
    pub fn blockers(&self, id: &str) -> Vec<&Issue> {
        self.deps
            .iter()
            .filter(|d| d.kind == DepKind::Blocks && d.from == id)
            .filter_map(|d| self.get_issue(&d.to))
            .collect()
    }

    /// Ids of issues blocked by `id` (inverse of [`blockers`]).
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.deps
            .iter()
            .filter(|d| d.kind == DepKind::Blocks && d.to == id)
            .map(|d| d.from.as_str())
            .collect()
    }

    /// Restrict the graph to `target` and its transitive blockers.
    pub fn filter_to_issue(&self, target: &str) -> BeadsGraph {
        let mut keep: HashSet<String> = HashSet::new();
        let mut stack = vec![target.to_string()];
        while let Some(id) = stack.pop() {
            if !keep.insert(id.clone()) {
                continue;
            }
            for dep in &self.deps {
                if dep.kind == DepKind::Blocks && dep.from == id {
                    stack.push(dep.to.clone());
                }
            }
        }

        BeadsGraph {
            issues: self
                .issues
                .iter()
                .filter(|i| keep.contains(&i.id))
                .cloned()
                .collect(),
            deps: self
                .deps
                .iter()
                .filter(|d| keep.contains(&d.from) && keep.contains(&d.to))
                .cloned()
                .collect(),
        }
    }

    /// Detect a cycle in the `blocks` DAG.
    ///
    /// Returns the offending path when one exists. The scheduler treats
    /// this as a fatal data error for the cycle.
    pub fn find_blocks_cycle(&self) -> Option<Vec<String>> {
        // Iterative DFS with a three-color marking.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks: HashMap<&str, Mark> = self
            .issues
            .iter()
            .map(|i| (i.id.as_str(), Mark::White))
            .collect();

        let adjacency: HashMap<&str, Vec<&str>> = {
            let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
            for dep in &self.deps {
                if dep.kind == DepKind::Blocks {
                    adj.entry(dep.from.as_str()).or_default().push(dep.to.as_str());
                }
            }
            adj
        };

        let ids: Vec<&str> = self.issues.iter().map(|i| i.id.as_str()).collect();
        for root in ids {
            if marks.get(root) != Some(&Mark::White) {
                continue;
            }

            let mut path: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            while let Some(&(node, next)) = stack.last() {
                if next == 0 {
                    marks.insert(node, Mark::Grey);
                    path.push(node);
                }
                let neighbors = adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
                if next < neighbors.len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let child = neighbors[next];
                    match marks.get(child) {
                        Some(Mark::Grey) => {
                            // Back edge — slice the cycle out of the current path.
                            let start = path.iter().position(|&p| p == child).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(child.to_string());
                            return Some(cycle);
                        }
                        Some(Mark::White) => stack.push((child, 0)),
                        _ => {}
                    }
                } else {
                    marks.insert(node, Mark::Black);
                    path.pop();
                    stack.pop();
                }
            }
        }

        None
    }
}
