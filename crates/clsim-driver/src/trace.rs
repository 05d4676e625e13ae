//! Per-call trace of the guest ABI.
//!
//! When `trace_calls` is enabled the dispatcher appends one [`CallRecord`]
//! per ABI call. The trace is plain serde data and is written out as JSON:
//!
//! ```json
//! {
//!   "seq": 3,
//!   "code": 9,
//!   "name": "si_kernel_create",
//!   "context": 0,
//!   "result": 0,
//!   "suspended": false
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::scheduler::ContextId;

/// One dispatched ABI call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Position in the trace, starting at 0.
    pub seq: u64,
    /// ABI operation code.
    pub code: u32,
    pub name: String,
    /// Guest context that issued the call.
    pub context: ContextId,
    /// Value written to the result register, absent when the call failed.
    pub result: Option<u32>,
    /// The calling context was parked by this call.
    #[serde(default)]
    pub suspended: bool,
    /// Fatal diagnostic, when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered list of call records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    records: Vec<CallRecord>,
}

impl CallTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        code: u32,
        name: &str,
        context: ContextId,
        outcome: Result<(u32, bool), String>,
    ) {
        let seq = self.records.len() as u64;
        let (result, suspended, error) = match outcome {
            Ok((value, suspended)) => (Some(value), suspended, None),
            Err(e) => (None, false, Some(e)),
        };
        self.records.push(CallRecord {
            seq,
            code,
            name: name.to_string(),
            context,
            result,
            suspended,
            error,
        });
    }

    pub fn records(&self) -> &[CallRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pretty-printed JSON array of records.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let records = serde_json::from_str(json)?;
        Ok(Self { records })
    }
}
