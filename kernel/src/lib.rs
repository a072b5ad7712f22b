//! Dev Kernel core library.
//!
//! The deterministic half of the autonomous development kernel:
//! - beads work-graph types and the store adapter
//! - the scheduler (ready set, critical path, admission, speculate)
//! - manifest and proof schemas shared with toolchain adapters
//! - the verifier (manifest-driven gates, candidate scoring, voting)
//! - repair synthesis from failed fab gates
//! - the append-only event log
//!
//! Process-edge concerns (adapters, workcells, git, the runner loop)
//! live in the `dev-kernel` binary crate.

pub mod config;
pub mod events;
pub mod manifest;
pub mod proof;
pub mod repair;
pub mod scheduler;
pub mod state;
pub mod verifier;

// Re-export the types that cross the crate boundary constantly.
pub use config::{ConfigError, GateCommands, KernelConfig, SpeculationConfig, ToolchainConfig};
pub use events::{utc_now_rfc3339, EventKind, EventLog, EventRecord};
pub use manifest::{
    build_quality_gates, FabGateSpec, GateDefinition, Manifest, ManifestIssue, RoutingHints,
};
pub use proof::{
    CommandRecord, DiffStats, GateResult, NextAction, PatchSummary, Proof, ProofMetadata,
    ProofStatus, Verdict, Verification,
};
pub use repair::{
    build_repair_issue, inject_repair_hints, RepairIssue, RepairPlaybook, REPAIR_END_MARKER,
    REPAIR_START_MARKER,
};
pub use scheduler::{Schedule, Scheduler, SchedulerConfig, SkipReason, SkippedIssue};
pub use state::{
    BeadsGraph, BeadsStore, Dep, DepKind, GraphError, Issue, IssueStatus, IssueUpdate, NewIssue,
    Priority, Risk,
};
pub use verifier::{Verifier, FORBIDDEN_PATHS_FAILURE};
