//! Human-approval checkpoint ("gavel") models.
//!
//! A gavel suspends a run at a designated action until a reviewer approves,
//! edits, rejects, or skips the in-flight output. At most one gavel may be
//! active per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Checkpoint configuration declared on an action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GavelConfig {
    /// The question put to the reviewer.
    pub prompt: String,

    /// Field names the reviewer may edit on an object-shaped output.
    /// For a string output, a single editable field replaces it wholesale.
    #[serde(default)]
    pub editable_fields: Vec<String>,

    /// Whether the reviewer (or a timeout) may skip the checkpoint.
    #[serde(default)]
    pub can_skip: bool,

    /// When set and no decision arrives in time: auto-skip if `can_skip`,
    /// otherwise the run stays paused indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A pending review, created when a gavel action suspends its run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GavelRequest {
    pub gavel_id: Uuid,
    pub run_id: Uuid,
    pub prompt: String,

    /// The in-flight output awaiting the verdict.
    pub current_output: Value,

    pub editable_fields: Vec<String>,
    pub can_skip: bool,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Reviewer edits submitted with an approval.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GavelModifications {
    /// Edited values, keyed by field for object outputs. A string output
    /// with one editable field is replaced wholesale.
    pub edited_values: Value,
}

/// Merge reviewer edits into a pending output.
///
/// Object outputs merge field-by-field, restricted to the declared editable
/// fields; anything else replaces the output wholesale when the edit is
/// non-null.
pub fn apply_modifications(
    output: &Value,
    modifications: &GavelModifications,
    editable_fields: &[String],
) -> Value {
    let edits = &modifications.edited_values;
    if edits.is_null() {
        return output.clone();
    }

    match (output, edits) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (key, value) in changes {
                if editable_fields.is_empty() || editable_fields.contains(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        _ => edits.clone(),
    }
}
