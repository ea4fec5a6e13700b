//! Context blob handling.
//!
//! The context map is assembled by an external collaborator and is opaque to
//! the scheduler. The only keys the scheduler writes are the markers below.

use serde_json::{Map, Value};

use dialback_core::TaskId;

pub const TASK_ID_KEY: &str = "task_id";
pub const REASON_KEY: &str = "reason";

/// Build the context handed to the dialer: the stored blob plus markers.
///
/// Markers always win over keys of the same name in the stored blob.
pub fn merge_context(existing: &Map<String, Value>, task_id: TaskId, reason: &str) -> Map<String, Value> {
    let mut merged = existing.clone();
    merged.insert(TASK_ID_KEY.to_string(), Value::String(task_id.to_string()));
    merged.insert(REASON_KEY.to_string(), Value::String(reason.to_string()));
    merged
}

/// Merge an enrichment map into a stored context, key by key.
pub fn enrich_context(base: &mut Map<String, Value>, enrichment: Map<String, Value>) {
    for (key, value) in enrichment {
        base.insert(key, value);
    }
}
