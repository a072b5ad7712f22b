//! Beads graph store adapter.
//!
//! All graph mutations funnel through this type; nothing else touches
//! the store's files. Two backends, decided once at construction:
//!
//! 1. the `bd` CLI, when the binary is on PATH (preferred);
//! 2. direct parsing of `.beads/issues.jsonl` + `.beads/deps.jsonl`,
//!    with YAML fallbacks, for repos without the CLI.
//!
//! Transient I/O failures surface as `false`/`None` from mutators and
//! are retried by the runner on the next cycle. Malformed lines are
//! skipped with a warning, never fatal.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::events::{utc_now_rfc3339, EventLog, EventRecord};
use crate::state::types::{BeadsGraph, Dep, DepKind, Issue, IssueStatus, Priority};

/// Which backend this store talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Cli,
    File,
}

/// Fields of an issue update. Unset fields are left untouched; the
/// underlying record is replaced wholesale so unknown fields survive.
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub status: Option<IssueStatus>,
    pub description: Option<String>,
    pub attempts: Option<u32>,
    pub parent: Option<String>,
    pub add_tags: Vec<String>,
}

impl IssueUpdate {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// A new issue to create (escalations, repairs).
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub parent: Option<String>,
}

pub struct BeadsStore {
    repo_root: PathBuf,
    beads_dir: PathBuf,
    bd_bin: String,
    backend: Backend,
    events: EventLog,
}

impl BeadsStore {
    /// Probe for the `bd` binary once and pick the backend.
    pub fn new(repo_root: impl AsRef<Path>, beads_dir: impl AsRef<Path>) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        let bd_bin =
            std::env::var("DEV_KERNEL_BEADS_BIN").unwrap_or_else(|_| "bd".to_string());
        let backend = if binary_on_path(&bd_bin) {
            Backend::Cli
        } else {
            Backend::File
        };
        debug!(bin = %bd_bin, ?backend, "Beads store initialized");

        Self {
            events: EventLog::for_repo(&repo_root),
            beads_dir: beads_dir.as_ref().to_path_buf(),
            repo_root,
            bd_bin,
            backend,
        }
    }

    /// File-backed store, never shelling out. Used by tests and repos
    /// without the beads CLI.
    pub fn file_backed(repo_root: impl AsRef<Path>, beads_dir: impl AsRef<Path>) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        Self {
            events: EventLog::for_repo(&repo_root),
            beads_dir: beads_dir.as_ref().to_path_buf(),
            repo_root,
            bd_bin: "bd".to_string(),
            backend: Backend::File,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    /// Append an event to the kernel log. Best-effort.
    pub fn append_event(&self, event: &EventRecord) -> bool {
        self.events.append(event)
    }

    // ===== Loading =====

    /// Load the full work graph. Missing files mean an empty graph;
    /// malformed entries are skipped.
    pub fn load_graph(&self) -> BeadsGraph {
        let issues = self.load_issues();
        let deps = self.load_deps();
        info!(
            issues = issues.len(),
            deps = deps.len(),
            backend = ?self.backend,
            "Loaded beads graph"
        );
        BeadsGraph::new(issues, deps)
    }

    /// Issues ready to work on: status open/ready with every `blocks`
    /// blocker done. Prefers the store's native readiness query.
    pub fn ready_issues(&self) -> Vec<Issue> {
        if self.backend == Backend::Cli {
            if let Some(issues) = self.bd_json::<Vec<Issue>>(&["ready", "--json"]) {
                return issues;
            }
        }

        let graph = self.load_graph();
        graph
            .issues
            .iter()
            .filter(|i| i.status.is_workable())
            .filter(|i| {
                graph
                    .blockers(&i.id)
                    .iter()
                    .all(|b| b.status == IssueStatus::Done)
            })
            .cloned()
            .collect()
    }

    fn load_issues(&self) -> Vec<Issue> {
        if self.backend == Backend::Cli {
            if let Some(issues) = self.bd_json::<Vec<Issue>>(&["list", "--json"]) {
                if !issues.is_empty() {
                    return issues;
                }
            }
        }

        let jsonl = self.beads_dir.join("issues.jsonl");
        if jsonl.exists() {
            let issues = parse_jsonl(&jsonl);
            if !issues.is_empty() {
                return issues;
            }
        }

        for ext in ["yaml", "yml"] {
            let path = self.beads_dir.join(format!("issues.{ext}"));
            if path.exists() {
                let issues = parse_yaml_list(&path, "issues");
                if !issues.is_empty() {
                    return issues;
                }
            }
        }

        Vec::new()
    }

    fn load_deps(&self) -> Vec<Dep> {
        let jsonl = self.beads_dir.join("deps.jsonl");
        if jsonl.exists() {
            let deps = parse_jsonl(&jsonl);
            if !deps.is_empty() {
                return deps;
            }
        }

        for ext in ["yaml", "yml"] {
            let path = self.beads_dir.join(format!("deps.{ext}"));
            if path.exists() {
                let deps = parse_yaml_list(&path, "deps");
                if !deps.is_empty() {
                    return deps;
                }
            }
        }

        Vec::new()
    }

    // ===== Mutations =====

    /// Update an issue. Atomic: the record is replaced wholesale or the
    /// call fails.
    pub fn update_issue(&self, issue_id: &str, update: &IssueUpdate) -> bool {
        match self.backend {
            Backend::Cli => self.update_issue_via_cli(issue_id, update),
            Backend::File => self.update_issue_via_file(issue_id, update),
        }
    }

    pub fn update_status(&self, issue_id: &str, status: IssueStatus) -> bool {
        self.update_issue(issue_id, &IssueUpdate::status(status))
    }

    /// Create a new issue; returns the assigned id.
    pub fn create_issue(&self, new_issue: &NewIssue) -> Option<String> {
        match self.backend {
            Backend::Cli => self.create_issue_via_cli(new_issue),
            Backend::File => self.create_issue_via_file(new_issue),
        }
    }

    /// Add a dependency edge. Idempotent on `(from, to, kind)`.
    pub fn add_edge(&self, from: &str, to: &str, kind: DepKind) -> bool {
        match self.backend {
            Backend::Cli => self.add_edge_via_cli(from, to, kind),
            Backend::File => self.add_edge_via_file(from, to, kind),
        }
    }

    /// Bump the attempt counter; returns the new count (0 when the
    /// issue is unknown).
    pub fn increment_attempts(&self, issue_id: &str) -> u32 {
        let graph = self.load_graph();
        let Some(issue) = graph.get_issue(issue_id) else {
            warn!(issue_id, "increment_attempts on unknown issue");
            return 0;
        };
        let new_attempts = issue.attempts + 1;
        let update = IssueUpdate {
            attempts: Some(new_attempts),
            ..Default::default()
        };
        if self.update_issue(issue_id, &update) {
            new_attempts
        } else {
            issue.attempts
        }
    }

    // ===== CLI backend =====

    fn bd_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Option<T> {
        let output = Command::new(&self.bd_bin)
            .args(args)
            .current_dir(&self.repo_root)
            .output();

        match output {
            Ok(out) if out.status.success() => match serde_json::from_slice(&out.stdout) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(bin = %self.bd_bin, args = ?args, error = %e, "Failed to parse bd output");
                    None
                }
            },
            Ok(out) => {
                debug!(
                    bin = %self.bd_bin,
                    args = ?args,
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "bd command failed"
                );
                None
            }
            Err(e) => {
                warn!(bin = %self.bd_bin, error = %e, "Failed to run bd");
                None
            }
        }
    }

    fn bd_ok(&self, args: &[String]) -> bool {
        let output = Command::new(&self.bd_bin)
            .args(args)
            .current_dir(&self.repo_root)
            .output();
        match output {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                warn!(
                    bin = %self.bd_bin,
                    args = ?args,
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "bd command failed"
                );
                false
            }
            Err(e) => {
                warn!(bin = %self.bd_bin, error = %e, "Failed to run bd");
                false
            }
        }
    }

    fn update_issue_via_cli(&self, issue_id: &str, update: &IssueUpdate) -> bool {
        let mut args = vec!["update".to_string(), issue_id.to_string()];
        if let Some(status) = update.status {
            args.push("--status".to_string());
            args.push(status.as_str().to_string());
        }
        if let Some(description) = &update.description {
            args.push("--description".to_string());
            args.push(description.clone());
        }
        if let Some(attempts) = update.attempts {
            args.push("--dk-attempts".to_string());
            args.push(attempts.to_string());
        }
        if let Some(parent) = &update.parent {
            args.push("--dk-parent".to_string());
            args.push(parent.clone());
        }
        for tag in &update.add_tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        args.push("--json".to_string());

        let ok = self.bd_ok(&args);
        if ok {
            info!(issue_id, status = ?update.status, "Issue updated");
        }
        ok
    }

    fn create_issue_via_cli(&self, new_issue: &NewIssue) -> Option<String> {
        let mut args = vec![
            "create".to_string(),
            new_issue.title.clone(),
            "--priority".to_string(),
            new_issue.priority.as_str().to_string(),
        ];
        if !new_issue.description.is_empty() {
            args.push("--description".to_string());
            args.push(new_issue.description.clone());
        }
        for tag in &new_issue.tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        args.push("--json".to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let created: Value = self.bd_json(&arg_refs)?;
        let issue_id = created.get("id").and_then(|v| v.as_str())?.to_string();

        if let Some(parent) = &new_issue.parent {
            let update = IssueUpdate {
                parent: Some(parent.clone()),
                ..Default::default()
            };
            self.update_issue_via_cli(&issue_id, &update);
        }

        info!(issue_id = %issue_id, title = %new_issue.title, "Issue created");
        Some(issue_id)
    }

    fn add_edge_via_cli(&self, from: &str, to: &str, kind: DepKind) -> bool {
        let args = vec![
            "dep".to_string(),
            "add".to_string(),
            from.to_string(),
            to.to_string(),
            "--type".to_string(),
            kind.as_str().to_string(),
            "--json".to_string(),
        ];
        let ok = self.bd_ok(&args);
        if ok {
            info!(from, to, kind = kind.as_str(), "Dependency added");
        }
        ok
    }

    // ===== File backend =====

    fn update_issue_via_file(&self, issue_id: &str, update: &IssueUpdate) -> bool {
        let path = self.beads_dir.join("issues.jsonl");
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read issues file");
                return false;
            }
        };

        let mut found = false;
        let mut records: Vec<Value> = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(mut record) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if record.get("id").and_then(|v| v.as_str()) == Some(issue_id) {
                found = true;
                apply_update(&mut record, update);
            }
            records.push(record);
        }

        if !found {
            warn!(issue_id, "Issue not found in store");
            return false;
        }

        self.write_jsonl_atomically(&path, &records)
    }

    fn create_issue_via_file(&self, new_issue: &NewIssue) -> Option<String> {
        if let Err(e) = std::fs::create_dir_all(&self.beads_dir) {
            warn!(error = %e, "Failed to create beads dir");
            return None;
        }
        let path = self.beads_dir.join("issues.jsonl");

        let existing_ids: Vec<String> = std::fs::read_to_string(&path)
            .map(|contents| {
                contents
                    .lines()
                    .filter_map(|l| serde_json::from_str::<Value>(l.trim()).ok())
                    .filter_map(|v| v.get("id").and_then(|i| i.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        // Smallest free numeric id, matching the CLI's numbering.
        let mut counter: u64 = 1;
        while existing_ids.iter().any(|id| id == &counter.to_string()) {
            counter += 1;
        }
        let issue_id = counter.to_string();

        let now = utc_now_rfc3339();
        let mut record = serde_json::json!({
            "id": issue_id,
            "title": new_issue.title,
            "status": "open",
            "created": now,
            "updated": now,
            "dk_priority": new_issue.priority.as_str(),
        });
        if !new_issue.description.is_empty() {
            record["description"] = Value::String(new_issue.description.clone());
        }
        if !new_issue.tags.is_empty() {
            record["tags"] = Value::Array(
                new_issue.tags.iter().cloned().map(Value::String).collect(),
            );
        }
        if let Some(parent) = &new_issue.parent {
            record["dk_parent"] = Value::String(parent.clone());
        }

        if !append_jsonl_line(&path, &record) {
            return None;
        }
        info!(issue_id = %issue_id, title = %new_issue.title, "Issue created");
        Some(issue_id)
    }

    fn add_edge_via_file(&self, from: &str, to: &str, kind: DepKind) -> bool {
        if let Err(e) = std::fs::create_dir_all(&self.beads_dir) {
            warn!(error = %e, "Failed to create beads dir");
            return false;
        }
        let path = self.beads_dir.join("deps.jsonl");

        // Idempotent on (from, to, kind).
        if let Ok(contents) = std::fs::read_to_string(&path) {
            let exists = contents
                .lines()
                .filter_map(|l| serde_json::from_str::<Dep>(l.trim()).ok())
                .any(|d| d.from == from && d.to == to && d.kind == kind);
            if exists {
                debug!(from, to, kind = kind.as_str(), "Edge already present");
                return true;
            }
        }

        let record = serde_json::json!({
            "from": from,
            "to": to,
            "type": kind.as_str(),
            "created": utc_now_rfc3339(),
        });
        let ok = append_jsonl_line(&path, &record);
        if ok {
            info!(from, to, kind = kind.as_str(), "Dependency added");
        }
        ok
    }

    fn write_jsonl_atomically(&self, path: &Path, records: &[Value]) -> bool {
        let tmp = path.with_extension("tmp");
        let mut body = String::new();
        for record in records {
            match serde_json::to_string(record) {
                Ok(line) => {
                    body.push_str(&line);
                    body.push('\n');
                }
                Err(e) => {
                    warn!(error = %e, "Failed to serialize record");
                    return false;
                }
            }
        }

        if let Err(e) = std::fs::write(&tmp, body) {
            warn!(path = %tmp.display(), error = %e, "Failed to write temp store file");
            return false;
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            warn!(path = %path.display(), error = %e, "Failed to replace store file");
            return false;
        }
        true
    }
}

fn apply_update(record: &mut Value, update: &IssueUpdate) {
    if let Some(status) = update.status {
        record["status"] = Value::String(status.as_str().to_string());
    }
    if let Some(description) = &update.description {
        record["description"] = Value::String(description.clone());
    }
    if let Some(attempts) = update.attempts {
        record["dk_attempts"] = Value::Number(attempts.into());
    }
    if let Some(parent) = &update.parent {
        record["dk_parent"] = Value::String(parent.clone());
    }
    if !update.add_tags.is_empty() {
        let mut tags: Vec<String> = record
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        for tag in &update.add_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        record["tags"] = Value::Array(tags.into_iter().map(Value::String).collect());
    }
    record["updated"] = Value::String(utc_now_rfc3339());
}

fn append_jsonl_line(path: &Path, record: &Value) -> bool {
    use std::io::Write;
    let line = match serde_json::to_string(record) {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "Failed to serialize record");
            return false;
        }
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to append record");
        return false;
    }
    true
}

/// Parse a JSON Lines file, skipping blanks, comments, and bad lines.
fn parse_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        warn!(path = %path.display(), "Failed to read store file");
        return Vec::new();
    };

    let mut items = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                path = %path.display(),
                line = line_num + 1,
                error = %e,
                "Skipping invalid JSON line"
            ),
        }
    }
    items
}

/// Parse a YAML file holding either a bare list or `{ <key>: [...] }`.
fn parse_yaml_list<T: serde::de::DeserializeOwned>(path: &Path, key: &str) -> Vec<T> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        warn!(path = %path.display(), "Failed to read store file");
        return Vec::new();
    };

    let value: serde_yaml::Value = match serde_yaml::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid YAML store file");
            return Vec::new();
        }
    };

    let list = match &value {
        serde_yaml::Value::Sequence(seq) => seq.clone(),
        serde_yaml::Value::Mapping(map) => map
            .get(key)
            .and_then(|v| v.as_sequence().cloned())
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    list.into_iter()
        .filter_map(|item| serde_yaml::from_value(item).ok())
        .collect()
}

/// Search PATH for an executable, the no-deps equivalent of `which`.
fn binary_on_path(name: &str) -> bool {
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(name).exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> BeadsStore {
        BeadsStore::file_backed(dir, dir.join(".beads"))
    }

    fn seed_issues(dir: &Path, lines: &[&str]) {
        let beads = dir.join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(beads.join("issues.jsonl"), contents).unwrap();
    }

    fn seed_deps(dir: &Path, lines: &[&str]) {
        let beads = dir.join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(beads.join("deps.jsonl"), contents).unwrap();
    }

    #[test]
    fn test_load_graph_from_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[
                r#"{"id":"1","title":"First","status":"open"}"#,
                r#"{"id":"2","title":"Second","status":"done","dk_priority":"P1"}"#,
            ],
        );
        seed_deps(dir.path(), &[r#"{"from":"1","to":"2","type":"blocks"}"#]);

        let graph = store(dir.path()).load_graph();
        assert_eq!(graph.issues.len(), 2);
        assert_eq!(graph.deps.len(), 1);
        assert_eq!(graph.get_issue("2").unwrap().priority, Priority::P1);
    }

    #[test]
    fn test_reload_without_mutation_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[r#"{"id":"1","title":"First","status":"open","custom_field":"kept"}"#],
        );

        let s = store(dir.path());
        let first = s.load_graph();
        let second = s.load_graph();
        assert_eq!(first.issues.len(), second.issues.len());
        assert_eq!(first.issues[0].id, second.issues[0].id);
        assert_eq!(first.issues[0].status, second.issues[0].status);
    }

    #[test]
    fn test_bad_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[
                r#"{"id":"1","title":"Good","status":"open"}"#,
                "not json at all",
                "# a comment",
                r#"{"id":"2","title":"Also good","status":"open"}"#,
            ],
        );

        let graph = store(dir.path()).load_graph();
        assert_eq!(graph.issues.len(), 2);
    }

    #[test]
    fn test_update_status_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[r#"{"id":"1","title":"First","status":"open","custom_field":"kept"}"#],
        );

        let s = store(dir.path());
        assert!(s.update_status("1", IssueStatus::Running));

        let raw = std::fs::read_to_string(dir.path().join(".beads/issues.jsonl")).unwrap();
        assert!(raw.contains("\"custom_field\":\"kept\""));
        assert!(raw.contains("\"status\":\"running\""));

        let graph = s.load_graph();
        assert_eq!(graph.get_issue("1").unwrap().status, IssueStatus::Running);
    }

    #[test]
    fn test_update_unknown_issue_fails() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(dir.path(), &[r#"{"id":"1","title":"First","status":"open"}"#]);
        assert!(!store(dir.path()).update_status("99", IssueStatus::Done));
    }

    #[test]
    fn test_create_issue_assigns_next_free_id() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[
                r#"{"id":"1","title":"First","status":"open"}"#,
                r#"{"id":"2","title":"Second","status":"open"}"#,
            ],
        );

        let s = store(dir.path());
        let id = s
            .create_issue(&NewIssue {
                title: "[ESCALATION] First".into(),
                description: "needs a human".into(),
                priority: Priority::P1,
                tags: vec!["escalation".into(), "needs-human".into()],
                parent: Some("1".into()),
            })
            .unwrap();
        assert_eq!(id, "3");

        let graph = s.load_graph();
        let created = graph.get_issue("3").unwrap();
        assert_eq!(created.parent.as_deref(), Some("1"));
        assert_eq!(created.priority, Priority::P1);
        assert!(created.tags.contains(&"needs-human".to_string()));
    }

    #[test]
    fn test_add_edge_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        assert!(s.add_edge("4", "3", DepKind::Blocks));
        assert!(s.add_edge("4", "3", DepKind::Blocks));
        // Same endpoints with a different kind is a distinct edge.
        assert!(s.add_edge("4", "3", DepKind::Related));

        let graph = s.load_graph();
        assert_eq!(graph.deps.len(), 2);
    }

    #[test]
    fn test_increment_attempts() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[r#"{"id":"1","title":"First","status":"open","dk_attempts":1}"#],
        );

        let s = store(dir.path());
        assert_eq!(s.increment_attempts("1"), 2);
        assert_eq!(s.increment_attempts("1"), 3);
        assert_eq!(s.increment_attempts("ghost"), 0);
    }

    #[test]
    fn test_ready_issues_computed_from_graph() {
        let dir = tempfile::tempdir().unwrap();
        seed_issues(
            dir.path(),
            &[
                r#"{"id":"1","title":"Free","status":"open"}"#,
                r#"{"id":"2","title":"Done","status":"done"}"#,
                r#"{"id":"3","title":"Unblocked","status":"ready"}"#,
                r#"{"id":"4","title":"Blocked","status":"open"}"#,
            ],
        );
        seed_deps(
            dir.path(),
            &[
                r#"{"from":"3","to":"2","type":"blocks"}"#,
                r#"{"from":"4","to":"3","type":"blocks"}"#,
            ],
        );

        let mut ready: Vec<String> = store(dir.path())
            .ready_issues()
            .into_iter()
            .map(|i| i.id)
            .collect();
        ready.sort();
        assert_eq!(ready, vec!["1", "3"]);
    }

    #[test]
    fn test_yaml_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let beads = dir.path().join(".beads");
        std::fs::create_dir_all(&beads).unwrap();
        std::fs::write(
            beads.join("issues.yaml"),
            "issues:\n  - id: \"1\"\n    title: From YAML\n    status: open\n",
        )
        .unwrap();

        let graph = store(dir.path()).load_graph();
        assert_eq!(graph.issues.len(), 1);
        assert_eq!(graph.issues[0].title, "From YAML");
    }

    #[test]
    fn test_missing_store_is_empty_graph() {
        let dir = tempfile::tempdir().unwrap();
        let graph = store(dir.path()).load_graph();
        assert!(graph.is_empty());
    }
}
