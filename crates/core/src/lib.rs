//! `dialback-core` - shared building blocks.
//!
//! This crate contains **pure** primitives (identifiers and the domain error
//! model) used by the follow-up and call-record domains. No IO lives here.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ApplicantId, CallRecordId, LeadId, TaskId};
