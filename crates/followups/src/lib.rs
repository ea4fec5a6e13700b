//! Follow-up call domain module.
//!
//! This crate contains the business rules for scheduled "call this contact back"
//! tasks, implemented purely as deterministic domain logic (no IO, no HTTP, no
//! storage):
//!
//! - `task`: the `FollowUpTask` record and its status state machine
//! - `timing`: the due-time resolver for free-form timing text
//! - `context`: merging of the opaque context blob handed to the dialer

pub mod context;
pub mod task;
pub mod timing;

pub use context::{REASON_KEY, TASK_ID_KEY, enrich_context, merge_context};
pub use task::{
    CLAIM_EXPIRED, Channel, Eligibility, FollowUpTask, Priority, TargetKind, TargetRef, TaskStatus,
};
pub use timing::resolve;
