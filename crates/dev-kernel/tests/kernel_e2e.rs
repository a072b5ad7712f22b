//! End-to-end kernel cycles against a file-backed beads store, a real
//! git repo, and scripted toolchain adapters.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dev_kernel::adapters::{CostEstimate, ToolchainAdapter};
use dev_kernel::dispatcher::Dispatcher;
use dev_kernel::runner::KernelRunner;
use kernel::{
    BeadsStore, EventKind, GateCommands, IssueStatus, KernelConfig, Manifest, Proof, ProofStatus,
    REPAIR_START_MARKER,
};

// ===== fixtures =====

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "kernel@test"]);
    git(dir, &["config", "user.name", "Kernel Test"]);
    std::fs::write(dir.join("README.md"), "seed\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "init"]);
}

fn seed_issue(dir: &Path, line: &str) {
    let beads = dir.join(".beads");
    std::fs::create_dir_all(&beads).unwrap();
    let path = beads.join("issues.jsonl");
    let mut contents = std::fs::read_to_string(&path).unwrap_or_default();
    contents.push_str(line);
    contents.push('\n');
    std::fs::write(path, contents).unwrap();
}

fn test_config(repo: &Path) -> KernelConfig {
    KernelConfig {
        repo_root: repo.to_path_buf(),
        beads_dir: PathBuf::from(".beads"),
        // Gates that always pass; individual tests override.
        gates: GateCommands {
            test_command: "true".into(),
            typecheck_command: "true".into(),
            lint_command: "true".into(),
            gate_timeout_seconds: 60,
        },
        toolchain_priority: vec!["scripted".into()],
        ..Default::default()
    }
}

/// What the scripted adapter should do inside the workcell.
#[derive(Clone, Copy)]
enum Script {
    /// Commit a file and report success.
    CommitAndSucceed,
    /// Touch nothing and report a failed run.
    Fail,
    /// Commit an asset file and report success (fab gates judge it).
    CommitAsset,
}

struct ScriptedAdapter {
    name: String,
    script: Script,
    file_name: String,
}

impl ScriptedAdapter {
    fn new(name: &str, script: Script, file_name: &str) -> Arc<dyn ToolchainAdapter> {
        Arc::new(Self {
            name: name.to_string(),
            script,
            file_name: file_name.to_string(),
        })
    }
}

#[async_trait]
impl ToolchainAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }
    fn available(&self) -> bool {
        true
    }
    async fn health_check(&self) -> bool {
        true
    }

    async fn execute(&self, manifest: &Manifest, workcell_path: &Path, _timeout: Duration) -> Proof {
        let (status, confidence) = match self.script {
            Script::CommitAndSucceed => {
                std::fs::write(
                    workcell_path.join(&self.file_name),
                    format!("agent output for issue {}\n", manifest.issue.id),
                )
                .unwrap();
                git(workcell_path, &["add", "."]);
                git(workcell_path, &["commit", "-m", "agent change"]);
                (ProofStatus::Success, 0.9)
            }
            Script::CommitAsset => {
                std::fs::write(workcell_path.join("asset.glb"), b"binary-ish").unwrap();
                git(workcell_path, &["add", "."]);
                git(workcell_path, &["commit", "-m", "asset export"]);
                (ProofStatus::Success, 0.8)
            }
            Script::Fail => (ProofStatus::Failed, 0.1),
        };

        let mut proof = Proof::new(&manifest.workcell_id, &manifest.issue.id, status);
        proof.patch.branch = manifest.branch_name.clone();
        proof.set_confidence(confidence);
        proof.metadata.toolchain = self.name.clone();
        if matches!(self.script, Script::Fail) {
            proof.metadata.error = Some("scripted failure".into());
        }
        proof.persist(workcell_path).unwrap();
        proof
    }

    fn estimate_cost(&self, manifest: &Manifest) -> CostEstimate {
        CostEstimate {
            estimated_tokens: manifest.issue.estimated_tokens,
            estimated_cost_usd: 0.0,
            model: "scripted".into(),
        }
    }
}

fn runner_with(
    config: KernelConfig,
    adapters: Vec<Arc<dyn ToolchainAdapter>>,
    single_cycle: bool,
) -> KernelRunner {
    let store = BeadsStore::file_backed(&config.repo_root, config.beads_path());
    let dispatcher = Dispatcher::with_adapters(config.clone(), adapters);
    KernelRunner::from_parts(config, store, dispatcher, single_cycle, None).unwrap()
}

// ===== scenarios =====

#[tokio::test]
async fn test_single_issue_completes_and_merges() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(
        dir.path(),
        r#"{"id":"1","title":"Add widget","status":"open"}"#,
    );

    let config = test_config(dir.path());
    let runner = runner_with(
        config.clone(),
        vec![ScriptedAdapter::new("scripted", Script::CommitAndSucceed, "widget.rs")],
        false,
    );
    let stats = runner.run().await;

    assert_eq!(stats.issues_completed, 1);
    assert_eq!(stats.issues_failed, 0);

    // Patch landed on main.
    assert!(dir.path().join("widget.rs").exists());

    // Store reflects completion; a done proof with all gates green
    // exists in the archive.
    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let graph = store.load_graph();
    assert_eq!(graph.get_issue("1").unwrap().status, IssueStatus::Done);

    // Event ordering for the issue is started before completed.
    let events = store.event_log().read_all();
    let kinds: Vec<&EventKind> = events
        .iter()
        .filter(|e| e.issue_id.as_deref() == Some("1"))
        .map(|e| &e.kind)
        .collect();
    let started = kinds.iter().position(|k| **k == EventKind::Started).unwrap();
    let completed = kinds.iter().position(|k| **k == EventKind::Completed).unwrap();
    assert!(started < completed);

    // Workcells cleaned up; winner logs archived.
    let workcells: Vec<_> = std::fs::read_dir(dir.path().join(".dev-kernel/workcells"))
        .map(|rd| rd.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(workcells.is_empty());
}

#[tokio::test]
async fn test_failures_escalate_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(
        dir.path(),
        r#"{"id":"1","title":"Impossible task","status":"open","dk_max_attempts":2}"#,
    );

    let config = test_config(dir.path());
    let runner = runner_with(
        config.clone(),
        vec![ScriptedAdapter::new("scripted", Script::Fail, "")],
        false,
    );
    let stats = runner.run().await;

    // Two attempts, then escalation drains the ready set.
    assert_eq!(stats.issues_completed, 0);
    assert_eq!(stats.issues_failed, 2);

    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let graph = store.load_graph();
    let original = graph.get_issue("1").unwrap();
    assert_eq!(original.status, IssueStatus::Escalated);
    assert_eq!(original.attempts, 2);

    // The escalation child: title, tags, parent.
    let child = graph
        .issues
        .iter()
        .find(|i| i.title == "[ESCALATION] Impossible task")
        .expect("escalation issue");
    assert_eq!(child.parent.as_deref(), Some("1"));
    assert!(child.tags.contains(&"escalation".to_string()));
    assert!(child.tags.contains(&"needs-human".to_string()));
    // Escalations wait for a human; they must not re-enter the ready set.
    assert_eq!(child.status, IssueStatus::Blocked);

    // Escalated event recorded for the original.
    let events = store.event_log().read_all();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Escalated && e.issue_id.as_deref() == Some("1")));
}

#[tokio::test]
async fn test_gate_failure_requeues_with_attempt() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(
        dir.path(),
        r#"{"id":"1","title":"Broken tests","status":"open","dk_max_attempts":3}"#,
    );

    let mut config = test_config(dir.path());
    config.gates.test_command = "false".into();

    let runner = runner_with(
        config,
        vec![ScriptedAdapter::new("scripted", Script::CommitAndSucceed, "broken.rs")],
        true, // single cycle: one failed attempt
    );
    runner.run().await;

    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let graph = store.load_graph();
    let issue = graph.get_issue("1").unwrap();
    assert_eq!(issue.status, IssueStatus::Ready);
    assert_eq!(issue.attempts, 1);

    // Nothing merged to main.
    assert!(!dir.path().join("broken.rs").exists());

    // The failed event names the gate, not a generic dispatch error.
    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let events = store.event_log().read_all();
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::Failed)
        .expect("failed event");
    let error = failed.data["error"].as_str().unwrap();
    assert!(error.contains("test"), "unexpected error summary: {error}");
}

#[tokio::test]
async fn test_speculate_vote_merges_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(
        dir.path(),
        r#"{"id":"1","title":"Risky change","status":"open","dk_risk":"high"}"#,
    );

    let mut config = test_config(dir.path());
    config.toolchain_priority = vec!["alpha".into(), "beta".into()];
    config.force_speculate = true;
    config.speculation.vote_threshold = 0.5;

    let runner = runner_with(
        config,
        vec![
            ScriptedAdapter::new("alpha", Script::CommitAndSucceed, "alpha.rs"),
            ScriptedAdapter::new("beta", Script::CommitAndSucceed, "beta.rs"),
        ],
        false,
    );
    let stats = runner.run().await;
    assert_eq!(stats.issues_completed, 1);

    // Exactly one candidate's patch landed.
    let alpha = dir.path().join("alpha.rs").exists();
    let beta = dir.path().join("beta.rs").exists();
    assert!(alpha ^ beta, "exactly one winner must merge");

    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    assert_eq!(
        store.load_graph().get_issue("1").unwrap().status,
        IssueStatus::Done
    );

    // All speculate workcells cleaned up.
    let leftover: Vec<_> = std::fs::read_dir(dir.path().join(".dev-kernel/workcells"))
        .map(|rd| rd.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftover.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_asset_failure_injects_repair_hints() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(
        dir.path(),
        r#"{"id":"1","title":"Model a sedan","status":"open","description":"Model a sedan.","tags":["asset:car"],"dk_max_attempts":5}"#,
    );

    // Stub fab-realism harness on PATH: always fails with a scale hint.
    let stub_dir = dir.path().join("stub-bin");
    std::fs::create_dir_all(&stub_dir).unwrap();
    let stub = stub_dir.join("fab-realism");
    std::fs::write(
        &stub,
        "#!/bin/sh\necho '{\"verdict\":\"fail\",\"scores\":{\"realism\":0.4},\"next_actions\":[{\"priority\":1,\"fail_code\":\"GEO_SCALE_IMPLAUSIBLE\",\"instructions\":\"Scale the model so its length is 3-6 m.\"}]}'\nexit 1\n",
    )
    .unwrap();
    std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
    let old_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{old_path}", stub_dir.display()));

    let config = test_config(dir.path());
    let run_once = || {
        runner_with(
            config.clone(),
            vec![ScriptedAdapter::new("scripted", Script::CommitAsset, "")],
            true,
        )
    };

    run_once().run().await;

    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let description = store.load_graph().get_issue("1").unwrap().description.clone();
    assert!(description.starts_with("Model a sedan."));
    assert_eq!(description.matches(REPAIR_START_MARKER).count(), 1);
    assert!(description.contains("[P1] GEO_SCALE_IMPLAUSIBLE: Scale the model so its length is 3-6 m."));

    // A second identical failure replaces the block instead of
    // appending a second one.
    run_once().run().await;
    let description = store.load_graph().get_issue("1").unwrap().description.clone();
    assert_eq!(description.matches(REPAIR_START_MARKER).count(), 1);
    assert!(description.contains("Attempt 2"));
}

#[tokio::test]
async fn test_dry_run_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(
        dir.path(),
        r#"{"id":"1","title":"Add widget","status":"open"}"#,
    );

    let mut config = test_config(dir.path());
    config.dry_run = true;

    let runner = runner_with(
        config,
        vec![ScriptedAdapter::new("scripted", Script::CommitAndSucceed, "widget.rs")],
        false,
    );
    let stats = runner.run().await;

    assert_eq!(stats.issues_completed, 0);
    assert!(!dir.path().join("widget.rs").exists());

    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    assert_eq!(
        store.load_graph().get_issue("1").unwrap().status,
        IssueStatus::Open
    );
}

#[tokio::test]
async fn test_blocks_cycle_is_a_fatal_graph_error() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(dir.path(), r#"{"id":"a","title":"A","status":"open"}"#);
    seed_issue(dir.path(), r#"{"id":"b","title":"B","status":"open"}"#);
    let beads = dir.path().join(".beads");
    std::fs::write(
        beads.join("deps.jsonl"),
        "{\"from\":\"a\",\"to\":\"b\",\"type\":\"blocks\"}\n{\"from\":\"b\",\"to\":\"a\",\"type\":\"blocks\"}\n",
    )
    .unwrap();

    let config = test_config(dir.path());
    let runner = runner_with(
        config,
        vec![ScriptedAdapter::new("scripted", Script::CommitAndSucceed, "x.rs")],
        true,
    );
    let stats = runner.run().await;

    assert!(runner.had_graph_error());
    assert_eq!(stats.issues_completed, 0);

    // Nothing was dispatched; an error event was recorded.
    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let graph = store.load_graph();
    assert_eq!(graph.get_issue("a").unwrap().status, IssueStatus::Open);
    assert!(store
        .event_log()
        .read_all()
        .iter()
        .any(|e| e.kind == EventKind::Error));
}

#[tokio::test]
async fn test_dependency_chain_resolves_in_order() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    seed_issue(dir.path(), r#"{"id":"1","title":"Base","status":"open"}"#);
    seed_issue(dir.path(), r#"{"id":"2","title":"On top","status":"open"}"#);
    let beads = dir.path().join(".beads");
    std::fs::write(
        beads.join("deps.jsonl"),
        "{\"from\":\"2\",\"to\":\"1\",\"type\":\"blocks\"}\n",
    )
    .unwrap();

    let config = test_config(dir.path());
    let runner = runner_with(
        config,
        vec![ScriptedAdapter::new("scripted", Script::CommitAndSucceed, "part.rs")],
        false,
    );
    let stats = runner.run().await;

    // Cycle 1 completes "1"; cycle 2 unblocks and completes "2".
    assert_eq!(stats.issues_completed, 2);
    assert!(stats.cycles >= 2);

    let store = BeadsStore::file_backed(dir.path(), dir.path().join(".beads"));
    let graph = store.load_graph();
    assert_eq!(graph.get_issue("1").unwrap().status, IssueStatus::Done);
    assert_eq!(graph.get_issue("2").unwrap().status, IssueStatus::Done);
}
