//! Scheduler — ready-set computation, critical-path ranking, admission.
//!
//! A pure function of `(graph, running set, config)`. Repeated
//! invocations on identical inputs produce identical schedules; every
//! tie-break ends in the issue id so the ordering is total.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::{BeadsGraph, GraphError, Issue, IssueStatus, Risk};

/// Why a ready issue was not admitted this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SlotLimit,
    TokenLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedIssue {
    pub id: String,
    pub reason: SkipReason,
}

/// One cycle's scheduling decision.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Admitted issues, in dispatch order.
    pub scheduled_lanes: Vec<Issue>,
    /// Ids of admitted issues marked for speculate+vote.
    pub speculate_issues: Vec<String>,
    /// Ready issues that failed admission, with the reason.
    pub skipped_issues: Vec<SkippedIssue>,
    /// The full ready set (ids, ranked order).
    pub ready_issues: Vec<String>,
    /// The longest `blocks` chain in the graph, blocker-first.
    pub critical_path: Vec<String>,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.scheduled_lanes.is_empty()
    }

    pub fn is_speculate(&self, issue_id: &str) -> bool {
        self.speculate_issues.iter().any(|id| id == issue_id)
    }
}

/// Admission limits and speculate policy for one scheduling pass.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_workcells: usize,
    pub max_concurrent_tokens: u64,
    pub force_speculate: bool,
}

impl From<&crate::config::KernelConfig> for SchedulerConfig {
    fn from(config: &crate::config::KernelConfig) -> Self {
        Self {
            max_concurrent_workcells: config.max_concurrent_workcells,
            max_concurrent_tokens: config.max_concurrent_tokens,
            force_speculate: config.force_speculate,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Compute the schedule for one cycle.
    ///
    /// Issues currently in `running` are excluded from candidates. A
    /// cycle in the `blocks` DAG or a dangling edge endpoint is a fatal
    /// graph data error.
    pub fn schedule(
        &self,
        graph: &BeadsGraph,
        running: &HashSet<String>,
    ) -> Result<Schedule, GraphError> {
        self.validate_edges(graph)?;
        if let Some(path) = graph.find_blocks_cycle() {
            return Err(GraphError::CycleDetected { path });
        }

        let longest = longest_paths(graph);
        let critical_path = critical_path(graph, &longest);

        // Ready set: workable status, blockers all done, not in flight,
        // attempts not exhausted.
        let mut ready: Vec<&Issue> = graph
            .issues
            .iter()
            .filter(|i| i.status.is_workable())
            .filter(|i| !running.contains(&i.id))
            .filter(|i| !i.attempts_exhausted())
            .filter(|i| {
                graph
                    .blockers(&i.id)
                    .iter()
                    .all(|b| b.status == IssueStatus::Done)
            })
            .collect();

        // Rank: critical-path length desc, then priority, then risk
        // (riskier first), then estimated tokens asc, then id.
        ready.sort_by(|a, b| {
            let la = longest.get(a.id.as_str()).copied().unwrap_or(1);
            let lb = longest.get(b.id.as_str()).copied().unwrap_or(1);
            lb.cmp(&la)
                .then(a.priority.cmp(&b.priority))
                .then(b.risk.rank().cmp(&a.risk.rank()))
                .then(a.estimated_tokens.cmp(&b.estimated_tokens))
                .then(a.id.cmp(&b.id))
        });

        let ready_issues: Vec<String> = ready.iter().map(|i| i.id.clone()).collect();

        // Admission: slot limit first, then the token budget.
        let mut scheduled_lanes: Vec<Issue> = Vec::new();
        let mut skipped_issues: Vec<SkippedIssue> = Vec::new();
        let mut tokens_admitted: u64 = 0;

        for issue in ready {
            if scheduled_lanes.len() >= self.config.max_concurrent_workcells {
                skipped_issues.push(SkippedIssue {
                    id: issue.id.clone(),
                    reason: SkipReason::SlotLimit,
                });
                continue;
            }
            if tokens_admitted + issue.estimated_tokens > self.config.max_concurrent_tokens {
                skipped_issues.push(SkippedIssue {
                    id: issue.id.clone(),
                    reason: SkipReason::TokenLimit,
                });
                continue;
            }
            tokens_admitted += issue.estimated_tokens;
            scheduled_lanes.push(issue.clone());
        }

        // Speculate marks are advisory; the dispatcher picks parallelism.
        let on_critical: HashSet<&str> = critical_path.iter().map(String::as_str).collect();
        let speculate_issues: Vec<String> = scheduled_lanes
            .iter()
            .filter(|i| self.should_speculate(i, &on_critical))
            .map(|i| i.id.clone())
            .collect();

        debug!(
            ready = ready_issues.len(),
            admitted = scheduled_lanes.len(),
            skipped = skipped_issues.len(),
            tokens = tokens_admitted,
            "Schedule computed"
        );
        if !speculate_issues.is_empty() {
            info!(issues = ?speculate_issues, "Speculate candidates selected");
        }

        Ok(Schedule {
            scheduled_lanes,
            speculate_issues,
            skipped_issues,
            ready_issues,
            critical_path,
        })
    }

    fn should_speculate(&self, issue: &Issue, on_critical: &HashSet<&str>) -> bool {
        if self.config.force_speculate {
            return true;
        }
        on_critical.contains(issue.id.as_str())
            && matches!(issue.risk, Risk::High | Risk::Critical)
            && issue.attempts * 2 < issue.max_attempts
    }

    fn validate_edges(&self, graph: &BeadsGraph) -> Result<(), GraphError> {
        for dep in &graph.deps {
            for id in [&dep.from, &dep.to] {
                if graph.get_issue(id).is_none() {
                    return Err(GraphError::MissingIssue { id: id.clone() });
                }
            }
        }
        Ok(())
    }
}

/// Longest downstream `blocks` chain for every node:
/// `longest(v) = 1 + max(longest(u))` over dependents `u` of `v`.
fn longest_paths(graph: &BeadsGraph) -> HashMap<&str, u32> {
    let mut memo: HashMap<&str, u32> = HashMap::new();

    for issue in &graph.issues {
        if memo.contains_key(issue.id.as_str()) {
            continue;
        }
        // Post-order DFS over dependents (graph is already cycle-checked).
        let mut stack: Vec<(&str, bool)> = vec![(issue.id.as_str(), false)];
        while let Some((node, processed)) = stack.pop() {
            if processed {
                let best = graph
                    .dependents(node)
                    .iter()
                    .filter_map(|d| memo.get(d).copied())
                    .max()
                    .unwrap_or(0);
                memo.insert(node, 1 + best);
            } else if !memo.contains_key(node) {
                stack.push((node, true));
                for dep in graph.dependents(node) {
                    if !memo.contains_key(dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }
    }

    memo
}

/// The concrete longest chain, blocker-first. Ties resolve to the
/// smallest id so the path is deterministic.
fn critical_path(graph: &BeadsGraph, longest: &HashMap<&str, u32>) -> Vec<String> {
    let mut start: Option<&str> = None;
    for issue in &graph.issues {
        let len = longest.get(issue.id.as_str()).copied().unwrap_or(1);
        let better = match start {
            None => true,
            Some(current) => {
                let current_len = longest.get(current).copied().unwrap_or(1);
                len > current_len || (len == current_len && issue.id.as_str() < current)
            }
        };
        if better {
            start = Some(issue.id.as_str());
        }
    }

    let mut path = Vec::new();
    let mut node = match start {
        Some(n) => n,
        None => return path,
    };
    loop {
        path.push(node.to_string());
        let mut next: Option<&str> = None;
        for dep in graph.dependents(node) {
            let len = longest.get(dep).copied().unwrap_or(1);
            let better = match next {
                None => true,
                Some(current) => {
                    let current_len = longest.get(current).copied().unwrap_or(1);
                    len > current_len || (len == current_len && dep < current)
                }
            };
            if better {
                next = Some(dep);
            }
        }
        match next {
            Some(n) => node = n,
            None => break,
        }
    }

    path
}
