//! Per-reconcile traces.
//!
//! A [`Trace`] records what one reconcile attempt actually did: the tool
//! calls it made, the reasoning it produced, and how it ended. Completing
//! a trace emits it to every subscribed sink; sinks are fire-and-forget
//! and can never fail the producer.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::debug;

/// Trace identifier: millisecond timestamp in the high bits, random
/// entropy in the low bits, so ids sort roughly by creation time while
/// staying unique across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TraceId(u128);

impl TraceId {
    fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u128;
        let entropy: u64 = rand::rng().random();
        TraceId((millis << 64) | u128::from(entropy))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Handle to an open tool-call record within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCallId(usize);

/// One tool invocation made during a reconcile.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Parameters the tool was invoked with.
    pub params: serde_json::Value,
    /// The tool's result, once finished successfully.
    pub result: Option<serde_json::Value>,
    /// The tool's error, if it failed.
    pub error: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call finished, if it has.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Receives completed traces.
///
/// Sinks are invoked after the trace is finalized and must be
/// fire-and-forget: a slow or broken sink may log its own trouble but has
/// no channel back to the producer.
pub trait TraceSink<T>: Send + Sync {
    /// Called once per completed trace.
    fn on_complete(&self, trace: &Trace<T>);
}

impl<T, F: Fn(&Trace<T>) + Send + Sync> TraceSink<T> for F {
    fn on_complete(&self, trace: &Trace<T>) {
        self(trace)
    }
}

/// A per-reconcile record of everything one attempt did.
#[derive(Serialize)]
pub struct Trace<T> {
    /// Unique, roughly time-ordered identifier.
    pub id: TraceId,
    /// Identifier of the input being reconciled (usually the work key).
    pub input: String,
    /// Tool invocations, in call order.
    pub tool_calls: Vec<ToolCall>,
    /// Free-form reasoning blocks.
    pub reasoning: Vec<String>,
    /// The final result, when the attempt produced one.
    pub result: Option<T>,
    /// The final error, when the attempt failed.
    pub error: Option<String>,
    /// When the trace was opened.
    pub started_at: DateTime<Utc>,
    /// When the trace was completed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    sinks: Vec<Arc<dyn TraceSink<T>>>,
}

impl<T> Trace<T> {
    /// Open a trace for `input`.
    pub fn begin(input: impl Into<String>) -> Self {
        Self {
            id: TraceId::generate(),
            input: input.into(),
            tool_calls: Vec::new(),
            reasoning: Vec::new(),
            result: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
            metadata: BTreeMap::new(),
            sinks: Vec::new(),
        }
    }

    /// Subscribe `sink` to the completion of this trace.
    pub fn subscribe(&mut self, sink: Arc<dyn TraceSink<T>>) {
        self.sinks.push(sink);
    }

    /// Append a reasoning block.
    pub fn reasoning(&mut self, text: impl Into<String>) {
        self.reasoning.push(text.into());
    }

    /// Attach a metadata entry.
    pub fn metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Open a tool-call record.
    pub fn start_tool_call(&mut self, name: impl Into<String>, params: serde_json::Value) -> ToolCallId {
        self.tool_calls.push(ToolCall {
            name: name.into(),
            params,
            result: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        });
        ToolCallId(self.tool_calls.len() - 1)
    }

    /// Close a tool-call record with its outcome. Unknown or already
    /// closed ids are ignored.
    pub fn end_tool_call(&mut self, id: ToolCallId, outcome: Result<serde_json::Value, String>) {
        let Some(call) = self.tool_calls.get_mut(id.0) else {
            return;
        };
        if call.ended_at.is_some() {
            return;
        }
        call.ended_at = Some(Utc::now());
        match outcome {
            Ok(value) => call.result = Some(value),
            Err(err) => call.error = Some(err),
        }
    }

    /// Finalize the trace with its outcome and emit it to every sink.
    pub fn complete(mut self, outcome: Result<T, String>) {
        self.ended_at = Some(Utc::now());
        match outcome {
            Ok(result) => self.result = Some(result),
            Err(err) => self.error = Some(err),
        }
        let sinks = std::mem::take(&mut self.sinks);
        debug!(id = %self.id, input = %self.input, sinks = sinks.len(), "trace completed");
        for sink in sinks {
            sink.on_complete(&self);
        }
    }
}
