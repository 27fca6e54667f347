//! Result text rendering
//!
//! Turns an invocation outcome and its trace into the deterministic text block
//! handed back to the calling agent, and writes the operator log.

use crate::sandbox::InvocationOutcome;
use crate::trace::{TraceEntry, TraceOutcome};
use serde_json::Value;

/// Log target for the per-invocation operator record
pub const OPERATOR_TARGET: &str = "ergon::operator";

/// Renders invocation outcomes as text
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFormatter {
    include_trace: bool,
}

impl ResultFormatter {
    /// Create a formatter; `include_trace` prefixes results with one line per call
    pub fn new(include_trace: bool) -> Self {
        Self { include_trace }
    }

    /// Whether trace lines are included
    pub fn includes_trace(&self) -> bool {
        self.include_trace
    }

    /// Render one trace entry as `name(args) → outcome`
    pub fn trace_line(entry: &TraceEntry) -> String {
        let outcome = match &entry.outcome {
            TraceOutcome::Value { value } => to_json(value),
            TraceOutcome::Error { message } => format!("Error: {message}"),
        };
        format!("{}({}) → {}", entry.capability, to_json(&entry.arguments), outcome)
    }

    /// Render the result text for an outcome
    pub fn render(&self, outcome: &InvocationOutcome, trace: &[TraceEntry]) -> String {
        // Aborts return the payload alone, whatever the trace setting
        if let InvocationOutcome::Aborted(value) = outcome {
            return match value {
                Value::String(text) => text.clone(),
                other => to_json(other),
            };
        }

        let mut text = String::new();
        if self.include_trace && !trace.is_empty() {
            for entry in trace {
                text.push_str(&Self::trace_line(entry));
                text.push('\n');
            }
            text.push('\n');
        }

        match outcome {
            InvocationOutcome::Completed(value) => {
                text.push_str("Final result: ");
                text.push_str(&to_json(value));
            }
            InvocationOutcome::ScriptError(message) | InvocationOutcome::SetupError(message) => {
                text.push_str("Script error: ");
                text.push_str(message);
            }
            InvocationOutcome::TimedOut { timeout_ms } => {
                text.push_str(&format!(
                    "Script error: Script execution timed out after {timeout_ms}ms"
                ));
            }
            InvocationOutcome::Aborted(_) => {}
        }
        text
    }

    /// Emit the script and its full trace on the operator log
    pub fn log_operator(script: &str, outcome: &InvocationOutcome, trace: &[TraceEntry]) {
        tracing::info!(
            target: OPERATOR_TARGET,
            outcome = outcome.kind(),
            calls = trace.len(),
            "Executed script:\n{script}"
        );
        for (position, entry) in trace.iter().enumerate() {
            tracing::info!(
                target: OPERATOR_TARGET,
                position,
                duration_ms = entry.duration.as_millis() as u64,
                "{}",
                Self::trace_line(entry)
            );
        }
    }
}

fn to_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
