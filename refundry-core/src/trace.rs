//! The versioned refund computation trace.
//!
//! Every execution persists a `calc_trace` inside each leg's `raw_request`
//! so that an auditor can replay exactly how the engine arrived at the
//! amounts it moved. The trace is also what the admin UI renders as
//! "computation detail".

use serde::{Deserialize, Serialize};

/// Schema version of the consumption-allocation algorithm. Version 1 rows
/// (the earlier proportional formula) may still appear in old audit rows.
pub const CALC_TRACE_SCHEMA_VERSION: u32 = 2;

/// One step of a computation trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub step_index: u32,
    pub name: String,
    pub detail: serde_json::Value,
}

/// An append-only, auto-indexing trace of one refund computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalcTrace {
    pub schema_version: u32,
    pub steps: Vec<TraceStep>,
}

impl CalcTrace {
    pub fn new() -> Self {
        Self {
            schema_version: CALC_TRACE_SCHEMA_VERSION,
            steps: Vec::new(),
        }
    }

    /// Append a step. Serialization failures are recorded in-band rather
    /// than propagated: a trace must never abort the refund it documents.
    pub fn push(&mut self, name: &str, detail: &impl Serialize) {
        let detail = serde_json::to_value(detail).unwrap_or_else(|e| {
            serde_json::json!({ "trace_serialize_error": e.to_string() })
        });
        self.steps.push(TraceStep {
            step_index: self.steps.len() as u32,
            name: name.to_owned(),
            detail,
        });
    }

    /// The trace as the JSON value persisted into `raw_request`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "trace_serialize_error": e.to_string() })
        })
    }
}

impl Default for CalcTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn steps_auto_index() {
        let mut trace = CalcTrace::new();
        trace.push("inputs", &serde_json::json!({ "user_id": 7 }));
        trace.push("fee", &serde_json::json!({ "fee_bps": 500 }));

        assert_eq!(trace.schema_version, CALC_TRACE_SCHEMA_VERSION);
        assert_eq!(trace.steps[0].step_index, 0);
        assert_eq!(trace.steps[1].step_index, 1);
        assert_eq!(trace.steps[1].name, "fee");

        let json = trace.to_json();
        assert_eq!(json["schema_version"], 2);
        assert_eq!(json["steps"][0]["name"], "inputs");
    }
}
