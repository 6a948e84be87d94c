//! # lattice-id
//!
//! Typed identifiers used between the scheduler and the resource manager.
//!
//! ## Design Principles
//!
//! - Resource-manager IDs (offers, agents, executors, frameworks) are opaque
//!   strings minted by the master; we only wrap them so they cannot be mixed up
//! - Scheduler task IDs are structured and carry the request, deploy, start time,
//!   instance number, host and rack they were launched with
//! - All IDs have a canonical string form with strict parsing
//!
//! ## Task ID Format
//!
//! `{request_id}-{deploy_id}-{started_at_ms}-{instance_no}-{host}-{rack_id}`
//!
//! The request ID may itself contain dashes, so parsing works from the right.
//! Hosts and racks are sanitized (`-` becomes `_`) when a task ID is built.

mod error;
mod macros;
mod task;
mod types;

pub use error::IdError;
pub use task::TaskId;
pub use types::*;
