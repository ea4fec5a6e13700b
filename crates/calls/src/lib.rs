//! Call record domain module.
//!
//! Pure logic for outbound call records and the provider events that update
//! them: record lifecycle, transcript ordering, and normalization of
//! provider-specific webhook payloads into one canonical shape.

pub mod payload;
pub mod record;
pub mod transcript;

pub use payload::ProviderEvent;
pub use record::{CallRecord, CallStatus, MetadataSnapshot, SnapshotSource};
pub use transcript::{TranscriptTurn, TurnInput, order_turns};
