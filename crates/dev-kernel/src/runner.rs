//! Kernel runner — the outer cycle loop.
//!
//! One cycle: load the graph, schedule, fan dispatches out in parallel,
//! verify each proof, then apply the success/failure policy (patch
//! merge, attempt counting, repair hints, escalation). The store is the
//! single source of truth for issue status; the running set lives only
//! in memory for the cycle's duration.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use kernel::{
    build_repair_issue, inject_repair_hints, BeadsStore, DepKind, EventKind, EventRecord,
    GraphError, Issue, IssueStatus, IssueUpdate, KernelConfig, NewIssue, Proof, RepairPlaybook,
    Schedule, Scheduler, SchedulerConfig, Verdict, Verifier,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::workcell::WorkcellManager;

/// Pause between cycles in watch mode.
const WATCH_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone)]
pub struct RunnerStats {
    pub issues_completed: u64,
    pub issues_failed: u64,
    pub cycles: u64,
    pub total_duration_ms: u64,
}

/// What one cycle did.
enum CycleOutcome {
    Dispatched,
    Idle,
}

/// What one lane produced, tallied after the fan-out joins.
struct LaneOutcome {
    completed: bool,
    duration_ms: u64,
}

pub struct KernelRunner {
    config: KernelConfig,
    store: BeadsStore,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    verifier: Verifier,
    workcells: WorkcellManager,
    playbook: RepairPlaybook,
    single_cycle: bool,
    target_issue: Option<String>,
    running: Mutex<HashSet<String>>,
    stats: Mutex<RunnerStats>,
    stop: Arc<AtomicBool>,
    graph_error: AtomicBool,
}

impl KernelRunner {
    pub fn new(
        config: KernelConfig,
        single_cycle: bool,
        target_issue: Option<String>,
    ) -> Result<Self> {
        let store = BeadsStore::new(&config.repo_root, config.beads_path());
        let dispatcher = Dispatcher::new(config.clone());
        Self::from_parts(config, store, dispatcher, single_cycle, target_issue)
    }

    /// Assemble a runner from explicit parts; the seam integration
    /// tests use to inject a file-backed store and scripted adapters.
    pub fn from_parts(
        config: KernelConfig,
        store: BeadsStore,
        dispatcher: Dispatcher,
        single_cycle: bool,
        target_issue: Option<String>,
    ) -> Result<Self> {
        let workcells = WorkcellManager::new(&config.repo_root)
            .context("Failed to initialize workcell manager")?;
        Ok(Self {
            scheduler: Scheduler::new(SchedulerConfig::from(&config)),
            verifier: Verifier::new(config.gates.clone()),
            playbook: RepairPlaybook::default(),
            config,
            store,
            dispatcher,
            workcells,
            single_cycle,
            target_issue,
            running: Mutex::new(HashSet::new()),
            stats: Mutex::new(RunnerStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            graph_error: AtomicBool::new(false),
        })
    }

    /// Shared stop flag; flipping it lets in-flight dispatches finish
    /// while preventing new cycles.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Did any cycle abort on a graph data error (cycle, dangling
    /// edge)? The CLI exits non-zero when so.
    pub fn had_graph_error(&self) -> bool {
        self.graph_error.load(Ordering::SeqCst)
    }

    /// Run the kernel loop until there is no more ready work (or one
    /// cycle, in single-cycle mode). Returns the run statistics.
    pub async fn run(&self) -> RunnerStats {
        info!(
            mode = if self.config.dry_run { "dry-run" } else { "live" },
            max_concurrent = self.config.max_concurrent_workcells,
            toolchains = ?self.dispatcher.available_toolchains(),
            target = ?self.target_issue,
            "Dev kernel starting"
        );
        for (name, healthy) in self.dispatcher.health_check_all().await {
            if !healthy {
                warn!(toolchain = %name, "Adapter binary present but health check failed");
            }
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested; finishing up");
                break;
            }

            self.stats.lock().expect("stats lock").cycles += 1;
            let cycle = self.stats.lock().expect("stats lock").cycles;
            info!(cycle, "Starting kernel cycle");

            let outcome = self.run_cycle().await;

            if self.single_cycle {
                info!("Single cycle complete");
                break;
            }
            if self.config.dry_run {
                // The schedule was printed; there is nothing to wait on.
                break;
            }

            match outcome {
                CycleOutcome::Dispatched => {}
                CycleOutcome::Idle => {
                    if !self.config.watch_mode {
                        info!("No more ready work");
                        break;
                    }
                    info!("Waiting for beads changes");
                    tokio::time::sleep(WATCH_POLL).await;
                }
            }
        }

        let stats = self.stats.lock().expect("stats lock").clone();
        info!(
            completed = stats.issues_completed,
            failed = stats.issues_failed,
            cycles = stats.cycles,
            total_ms = stats.total_duration_ms,
            "Run summary"
        );
        stats
    }

    /// One scheduling cycle. Graph data errors abort the cycle with an
    /// error event; the loop returns to idle.
    async fn run_cycle(&self) -> CycleOutcome {
        let mut graph = self.store.load_graph();
        if graph.is_empty() {
            warn!("No issues found in beads");
            return CycleOutcome::Idle;
        }

        if let Some(target) = &self.target_issue {
            graph = graph.filter_to_issue(target);
            if graph.is_empty() {
                warn!(target = %target, "Target issue not found");
                return CycleOutcome::Idle;
            }
        }

        let running = self.running.lock().expect("running lock").clone();
        let schedule = match self.scheduler.schedule(&graph, &running) {
            Ok(schedule) => schedule,
            Err(e @ (GraphError::CycleDetected { .. } | GraphError::MissingIssue { .. })) => {
                error!(error = %e, "Graph data error; failing this cycle");
                self.graph_error.store(true, Ordering::SeqCst);
                self.store.append_event(
                    &EventRecord::new(EventKind::Error, None).with("error", e.to_string()),
                );
                return CycleOutcome::Idle;
            }
            Err(e) => {
                warn!(error = %e, "Scheduling failed; retrying next cycle");
                return CycleOutcome::Idle;
            }
        };

        if schedule.is_empty() {
            info!("Nothing ready to schedule");
            return CycleOutcome::Idle;
        }

        self.log_schedule(&schedule);

        if self.config.dry_run {
            info!("Dry run; no changes made");
            return CycleOutcome::Dispatched;
        }

        // Fan out: one task per admitted lane. Total concurrency is
        // bounded by admission (max_concurrent_workcells).
        let lanes = join_all(schedule.scheduled_lanes.iter().map(|issue| {
            let speculate = schedule.is_speculate(&issue.id);
            async move {
                if speculate {
                    self.run_speculate_lane(issue).await
                } else {
                    self.run_single_lane(issue).await
                }
            }
        }))
        .await;

        let mut stats = self.stats.lock().expect("stats lock");
        for lane in lanes {
            if lane.completed {
                stats.issues_completed += 1;
            } else {
                stats.issues_failed += 1;
            }
            stats.total_duration_ms += lane.duration_ms;
        }

        CycleOutcome::Dispatched
    }

    fn log_schedule(&self, schedule: &Schedule) {
        for issue in &schedule.scheduled_lanes {
            info!(
                issue_id = %issue.id,
                title = %issue.title,
                priority = issue.priority.as_str(),
                risk = issue.risk.as_str(),
                mode = if schedule.is_speculate(&issue.id) { "speculate" } else { "single" },
                "Scheduled"
            );
        }
        for skipped in &schedule.skipped_issues {
            info!(issue_id = %skipped.id, reason = ?skipped.reason, "Skipped");
        }
    }

    fn mark_running(&self, issue_id: &str) {
        self.running
            .lock()
            .expect("running lock")
            .insert(issue_id.to_string());
    }

    fn mark_done_running(&self, issue_id: &str) {
        self.running.lock().expect("running lock").remove(issue_id);
    }

    // ===== Single dispatch =====

    async fn run_single_lane(&self, issue: &Issue) -> LaneOutcome {
        info!(issue_id = %issue.id, title = %issue.title, "Dispatching");
        self.mark_running(&issue.id);

        let outcome = self.run_single_lane_inner(issue).await;

        self.mark_done_running(&issue.id);
        outcome
    }

    async fn run_single_lane_inner(&self, issue: &Issue) -> LaneOutcome {
        let workcell_path = match self.workcells.create(&issue.id, None) {
            Ok(path) => path,
            Err(e) => {
                error!(issue_id = %issue.id, error = %e, "Failed to create workcell");
                self.store.append_event(
                    &EventRecord::new(EventKind::Failed, Some(&issue.id))
                        .with("error", e.to_string()),
                );
                return LaneOutcome {
                    completed: false,
                    duration_ms: 0,
                };
            }
        };

        self.store.update_status(&issue.id, IssueStatus::Running);
        self.store.append_event(
            &EventRecord::new(EventKind::Started, Some(&issue.id)).with("mode", "single"),
        );

        let mut result = self.dispatcher.dispatch(issue, &workcell_path, None, None).await;
        let duration_ms = result.duration_ms;

        let verified = match result.proof.as_mut() {
            Some(proof) if result.success => self.verifier.verify(proof, &workcell_path).await,
            _ => false,
        };

        let completed = if verified {
            self.handle_success(issue, &result, &workcell_path).await
        } else {
            self.handle_failure(issue, Some(&result), &workcell_path).await;
            false
        };

        LaneOutcome {
            completed,
            duration_ms,
        }
    }

    // ===== Speculate dispatch =====

    async fn run_speculate_lane(&self, issue: &Issue) -> LaneOutcome {
        self.mark_running(&issue.id);
        let outcome = self.run_speculate_lane_inner(issue).await;
        self.mark_done_running(&issue.id);
        outcome
    }

    async fn run_speculate_lane_inner(&self, issue: &Issue) -> LaneOutcome {
        // One candidate per available toolchain, capped by config.
        let mut candidates = self.dispatcher.speculate_candidates(issue);
        let parallelism = self
            .config
            .speculation
            .max_parallel
            .min(candidates.len())
            .max(1);
        candidates.truncate(parallelism);

        if candidates.is_empty() {
            error!(issue_id = %issue.id, "No available toolchains for speculate");
            self.handle_failure_no_workcell(issue, "no_adapter_available").await;
            return LaneOutcome {
                completed: false,
                duration_ms: 0,
            };
        }

        info!(
            issue_id = %issue.id,
            title = %issue.title,
            candidates = ?candidates,
            "Speculate dispatch"
        );

        // One workcell per candidate.
        let mut workcells = Vec::new();
        for toolchain in &candidates {
            let tag = format!("spec-{toolchain}");
            match self.workcells.create(&issue.id, Some(&tag)) {
                Ok(path) => workcells.push((toolchain.clone(), tag, path)),
                Err(e) => {
                    warn!(issue_id = %issue.id, toolchain = %toolchain, error = %e, "Workcell creation failed");
                }
            }
        }
        if workcells.is_empty() {
            self.handle_failure_no_workcell(issue, "workcell_creation_failed").await;
            return LaneOutcome {
                completed: false,
                duration_ms: 0,
            };
        }

        self.store.update_status(&issue.id, IssueStatus::Running);
        self.store.append_event(
            &EventRecord::new(EventKind::Started, Some(&issue.id))
                .with("mode", "speculate")
                .with("parallelism", workcells.len() as u64),
        );

        let mut results = self.dispatcher.dispatch_speculate(issue, &workcells).await;
        let duration_ms = results.iter().map(|r| r.duration_ms).max().unwrap_or(0);

        // Verify every candidate before voting; the vote needs each
        // candidate's verified proof.
        for result in results.iter_mut() {
            if let Some(proof) = result.proof.as_mut() {
                if let Some((_, _, path)) =
                    workcells.iter().find(|(_, _, p)| {
                        p.file_name().and_then(|n| n.to_str()) == Some(result.workcell_id.as_str())
                    })
                {
                    self.verifier.verify(proof, path).await;
                }
            }
        }

        let proofs: Vec<Proof> = results
            .iter()
            .filter_map(|r| r.proof.clone())
            .collect();
        let winner_workcell = kernel::verifier::vote(&proofs, self.config.speculation.vote_threshold)
            .map(|p| p.workcell_id.clone())
            // Vote came up empty: fall back to the best verified
            // candidate, then the most confident successful dispatch.
            .or_else(|| {
                proofs
                    .iter()
                    .filter(|p| p.verification.all_passed)
                    .max_by(|a, b| {
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.workcell_id.cmp(&a.workcell_id))
                    })
                    .map(|p| p.workcell_id.clone())
            })
            .or_else(|| {
                results
                    .iter()
                    .filter(|r| r.success)
                    .filter_map(|r| r.proof.as_ref())
                    .max_by(|a, b| {
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.workcell_id.cmp(&a.workcell_id))
                    })
                    .map(|p| p.workcell_id.clone())
            });

        let winner_index = winner_workcell
            .as_deref()
            .and_then(|id| results.iter().position(|r| r.workcell_id == id));

        let completed = match winner_index {
            Some(index) => {
                let winner_path = workcells
                    .iter()
                    .find(|(_, _, p)| {
                        p.file_name().and_then(|n| n.to_str())
                            == Some(results[index].workcell_id.as_str())
                    })
                    .map(|(_, _, p)| p.clone());
                let Some(winner_path) = winner_path else {
                    self.handle_failure_no_workcell(issue, "winner workcell missing").await;
                    self.cleanup_all(&workcells, None);
                    return LaneOutcome {
                        completed: false,
                        duration_ms,
                    };
                };

                let verified = results[index]
                    .proof
                    .as_ref()
                    .map(|p| p.verification.all_passed)
                    .unwrap_or(false);

                let completed = if verified {
                    self.handle_success(issue, &results[index], &winner_path).await
                } else {
                    self.handle_failure(issue, Some(&results[index]), &winner_path)
                        .await;
                    false
                };

                // Losers are cleaned up without applying their patches.
                self.cleanup_all(&workcells, Some(&winner_path));
                completed
            }
            None => {
                // Nothing usable came back; fail on the first candidate.
                let first_path = workcells[0].2.clone();
                self.handle_failure(issue, results.first(), &first_path).await;
                self.cleanup_all(&workcells, Some(&first_path));
                false
            }
        };

        LaneOutcome {
            completed,
            duration_ms,
        }
    }

    fn cleanup_all(&self, workcells: &[(String, String, std::path::PathBuf)], keep: Option<&Path>) {
        for (_, _, path) in workcells {
            if Some(path.as_path()) == keep {
                continue;
            }
            if let Err(e) = self.workcells.cleanup(path, false) {
                warn!(path = %path.display(), error = %e, "Workcell cleanup failed");
            }
        }
    }

    // ===== Success / failure policy =====

    /// Returns `true` when the issue fully completed (patch applied).
    async fn handle_success(
        &self,
        issue: &Issue,
        result: &DispatchResult,
        workcell_path: &Path,
    ) -> bool {
        let Some(proof) = result.proof.as_ref() else {
            self.handle_failure(issue, Some(result), workcell_path).await;
            return false;
        };

        // The merge is the last gate; a conflict is a failure attempt.
        if !self.workcells.apply_patch(proof, workcell_path) {
            error!(issue_id = %issue.id, "Patch application failed");
            self.handle_failure(issue, Some(result), workcell_path).await;
            return false;
        }

        info!(issue_id = %issue.id, "Issue completed");
        self.store.update_status(&issue.id, IssueStatus::Done);
        self.store.append_event(
            &EventRecord::new(EventKind::Completed, Some(&issue.id))
                .with("toolchain", result.toolchain.clone())
                .with("duration_ms", result.duration_ms)
                .with(
                    "speculate_tag",
                    result
                        .speculate_tag
                        .clone()
                        .map(serde_json::Value::String)
                        .unwrap_or(serde_json::Value::Null),
                ),
        );

        if let Err(e) = self.workcells.cleanup(workcell_path, true) {
            warn!(issue_id = %issue.id, error = %e, "Workcell cleanup failed");
        }
        true
    }

    async fn handle_failure(
        &self,
        issue: &Issue,
        result: Option<&DispatchResult>,
        workcell_path: &Path,
    ) {
        let attempts = self.store.increment_attempts(&issue.id);

        // Verification context beats the dispatcher's error string.
        let proof = result.and_then(|r| r.proof.as_ref());
        let error_summary = proof
            .filter(|p| !p.verification.blocking_failures.is_empty())
            .map(|p| format!("Gate failures: {}", p.verification.blocking_failures.join(", ")))
            .or_else(|| result.and_then(|r| r.error.clone()))
            .unwrap_or_else(|| "Unknown error".to_string());

        warn!(
            issue_id = %issue.id,
            attempt = attempts,
            max_attempts = issue.max_attempts,
            error = %error_summary,
            "Issue failed"
        );

        self.store.append_event(
            &EventRecord::new(EventKind::Failed, Some(&issue.id))
                .with(
                    "toolchain",
                    result.map(|r| r.toolchain.clone()).unwrap_or_default(),
                )
                .with("error", error_summary.clone())
                .with("attempt", attempts),
        );

        if let Some(proof) = proof {
            self.synthesize_repairs(issue, proof, attempts);
        }

        if attempts >= issue.max_attempts {
            self.escalate(issue, &error_summary);
        } else {
            self.store.update_status(&issue.id, IssueStatus::Ready);
        }

        if let Err(e) = self.workcells.cleanup(workcell_path, true) {
            warn!(issue_id = %issue.id, error = %e, "Workcell cleanup failed");
        }
    }

    /// Failure path for lanes that never got a workcell.
    async fn handle_failure_no_workcell(&self, issue: &Issue, error: &str) {
        let attempts = self.store.increment_attempts(&issue.id);
        self.store.append_event(
            &EventRecord::new(EventKind::Failed, Some(&issue.id))
                .with("error", error)
                .with("attempt", attempts),
        );
        if attempts >= issue.max_attempts {
            self.escalate(issue, error);
        } else {
            self.store.update_status(&issue.id, IssueStatus::Ready);
        }
    }

    /// Repair synthesis for asset issues.
    ///
    /// Failed fab gates with repair hints rewrite the autogen block in
    /// the issue description; a gate that verdicts `escalate` gets a
    /// dedicated child repair issue instead of relying on the retry.
    fn synthesize_repairs(&self, issue: &Issue, proof: &Proof, attempts: u32) {
        if !issue.is_asset() {
            return;
        }

        let failing: Vec<(String, Vec<kernel::NextAction>)> = proof
            .failing_gates_with_actions()
            .into_iter()
            .map(|(name, actions)| (name.to_string(), actions.to_vec()))
            .collect();

        if !failing.is_empty() {
            let new_description = inject_repair_hints(&issue.description, &failing, attempts);
            let update = IssueUpdate {
                description: Some(new_description),
                ..Default::default()
            };
            if self.store.update_issue(&issue.id, &update) {
                info!(issue_id = %issue.id, "Repair hints written to issue description");
            }
        }

        // A gate explicitly requesting escalation gets a repair task.
        let escalating_gate = proof
            .verification
            .gates
            .iter()
            .find(|(_, g)| g.verdict == Some(Verdict::Escalate));
        if let Some((gate_name, gate)) = escalating_gate {
            let fail_codes: Vec<String> = gate
                .next_actions
                .iter()
                .map(|a| a.fail_code.clone())
                .filter(|c| !c.is_empty())
                .collect();
            let render_paths: Vec<String> = gate
                .artifacts
                .as_ref()
                .and_then(|a| a.get("renders"))
                .and_then(|r| r.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();

            let repair = build_repair_issue(
                &self.playbook,
                &issue.id,
                &issue.title,
                attempts,
                &fail_codes,
                &gate.scores,
                &render_paths,
            );

            let created = self.store.create_issue(&NewIssue {
                title: repair.title.clone(),
                description: repair.description.clone(),
                priority: repair.priority,
                tags: repair.tags.clone(),
                parent: Some(issue.id.clone()),
            });

            if let Some(repair_id) = created {
                self.store.add_edge(&issue.id, &repair_id, DepKind::ParentOf);
                self.store.append_event(
                    &EventRecord::new(EventKind::RepairCreated, Some(&issue.id))
                        .with("repair_issue", repair_id.clone())
                        .with("gate", gate_name.clone())
                        .with("fail_codes", json!(repair.fail_codes)),
                );
                info!(
                    issue_id = %issue.id,
                    repair_id = %repair_id,
                    "Repair issue created"
                );
            }
        }
    }

    fn escalate(&self, issue: &Issue, error_summary: &str) {
        self.store.update_status(&issue.id, IssueStatus::Escalated);
        self.store.append_event(
            &EventRecord::new(EventKind::Escalated, Some(&issue.id))
                .with("attempts", issue.max_attempts)
                .with("error", error_summary),
        );
        warn!(issue_id = %issue.id, "Issue escalated (max attempts reached)");

        let mut tags: Vec<String> = issue.tags.clone();
        for tag in ["escalation", "needs-human"] {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        tags.sort();

        let description = format!(
            "Automated processing failed after {} attempts.\n\n\
             ## Original Issue #{}\n{}\n\n\
             ## Failure Details\n{}\n\n\
             ## Action Required\nManual review and intervention needed.",
            issue.max_attempts,
            issue.id,
            if issue.description.is_empty() {
                "(no description)"
            } else {
                &issue.description
            },
            error_summary,
        );

        let created = self.store.create_issue(&NewIssue {
            title: format!("[ESCALATION] {}", issue.title),
            description,
            priority: issue.priority,
            tags,
            parent: Some(issue.id.clone()),
        });

        match created {
            Some(escalation_id) => {
                // Escalations wait for a human; blocked keeps them out
                // of the ready set until someone reopens them.
                self.store.update_status(&escalation_id, IssueStatus::Blocked);
                self.store
                    .add_edge(&issue.id, &escalation_id, DepKind::ParentOf);
                info!(
                    issue_id = %issue.id,
                    escalation_id = %escalation_id,
                    "Escalation issue created"
                );
            }
            None => error!(issue_id = %issue.id, "Failed to create escalation issue"),
        }
    }
}
