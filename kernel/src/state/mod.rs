//! Work-graph state: issue/dependency types and the beads store adapter.

mod store;
mod types;

pub use store::{BeadsStore, IssueUpdate, NewIssue};
pub use types::{BeadsGraph, Dep, DepKind, GraphError, Issue, IssueStatus, Priority, Risk};
