//! Execution trace recorder
//!
//! An append-only log of completed capability calls for one invocation. Entries
//! are ordered by completion, not by issue: a script awaiting several calls
//! together records whichever finishes first first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Outcome of one capability call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceOutcome {
    /// The call produced a value (after envelope adaptation)
    Value {
        /// The value handed onward
        value: Value,
    },

    /// The call failed
    Error {
        /// Failure message
        message: String,
    },
}

impl TraceOutcome {
    /// Whether the call failed
    pub fn is_error(&self) -> bool {
        matches!(self, TraceOutcome::Error { .. })
    }
}

/// One completed capability call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Original (unsanitized) capability name
    pub capability: String,

    /// Normalized arguments
    pub arguments: Value,

    /// Result or error
    pub outcome: TraceOutcome,

    /// Wall-clock time the host spent in the call
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TraceEntry {
    /// Successful call
    pub fn value(capability: impl Into<String>, arguments: Value, value: Value) -> Self {
        Self {
            capability: capability.into(),
            arguments,
            outcome: TraceOutcome::Value { value },
            duration: Duration::ZERO,
        }
    }

    /// Failed call
    pub fn error(
        capability: impl Into<String>,
        arguments: Value,
        message: impl Into<String>,
    ) -> Self {
        Self {
            capability: capability.into(),
            arguments,
            outcome: TraceOutcome::Error {
                message: message.into(),
            },
            duration: Duration::ZERO,
        }
    }

    /// Set the call duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Shared, append-only trace for one invocation.
///
/// Cloning yields another handle to the same log. Appends are serialized by a
/// mutex, so concurrent capability completions never interleave.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

impl ExecutionTrace {
    /// Create an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed call
    pub async fn record(&self, entry: TraceEntry) {
        let mut entries = self.entries.lock().await;
        tracing::debug!(
            capability = %entry.capability,
            position = entries.len(),
            failed = entry.outcome.is_error(),
            "Capability call recorded"
        );
        entries.push(entry);
    }

    /// Number of recorded calls
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing has been recorded
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of the entries recorded so far
    pub async fn snapshot(&self) -> Vec<TraceEntry> {
        self.entries.lock().await.clone()
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
