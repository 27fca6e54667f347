//! Sandboxed script execution
//!
//! [`SandboxEngine`] runs one script per invocation in a fresh QuickJS isolate:
//! - The isolate is bounded by a memory ceiling and a wall-clock timeout
//! - Each registered capability is bound as an async global function
//! - Every completed capability call lands in the invocation's trace
//! - An inspection callback can abort the invocation from the host side
//!
//! The isolate is not `Send`, so each invocation runs on its own thread with a
//! single-threaded tokio runtime. Capability futures run on that runtime too.
//! The public API stays async and `Send`.

mod engine;
mod isolate;
mod lifecycle;

pub use isolate::CONSOLE_TARGET;
pub use lifecycle::{EngineState, IsolateObserver, NoopObserver};

use crate::bridge::InspectionCallback;
use crate::capability::{CapabilityTable, EnvelopeAdapter, McpEnvelopeAdapter};
use crate::config::SandboxConfig;
use crate::format::ResultFormatter;
use crate::trace::{ExecutionTrace, TraceEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The script returned this value
    Completed(Value),

    /// The host inspection callback aborted with this value
    Aborted(Value),

    /// The wall-clock budget elapsed first
    TimedOut {
        /// The configured budget
        timeout_ms: u64,
    },

    /// The script threw, or its result could not cross the boundary
    ScriptError(String),

    /// The isolate or its bindings could not be set up
    SetupError(String),
}

impl InvocationOutcome {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationOutcome::Completed(_) => "completed",
            InvocationOutcome::Aborted(_) => "aborted",
            InvocationOutcome::TimedOut { .. } => "timed_out",
            InvocationOutcome::ScriptError(_) => "script_error",
            InvocationOutcome::SetupError(_) => "setup_error",
        }
    }

    /// Whether the invocation produced a result (completed or aborted)
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InvocationOutcome::Completed(_) | InvocationOutcome::Aborted(_)
        )
    }
}

/// Structured result of one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationReport {
    /// Invocation identifier (also attached to every log line)
    pub invocation_id: Uuid,

    /// How the invocation ended
    pub outcome: InvocationOutcome,

    /// Completed capability calls, in completion order
    pub trace: Vec<TraceEntry>,

    /// Wall-clock time from submission to disposal
    #[serde(with = "crate::trace::duration_millis")]
    pub duration: Duration,
}

/// Runs scripts in isolated, resource-bounded contexts
#[derive(Clone)]
pub struct SandboxEngine {
    config: SandboxConfig,
    adapter: Option<Arc<dyn EnvelopeAdapter>>,
    inspector: Option<Arc<dyn InspectionCallback>>,
    observer: Arc<dyn IsolateObserver>,
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("config", &self.config)
            .field("has_adapter", &self.adapter.is_some())
            .field("has_inspector", &self.inspector.is_some())
            .finish()
    }
}

impl SandboxEngine {
    /// Create an engine with the MCP envelope adapter and no inspection callback
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            adapter: Some(Arc::new(McpEnvelopeAdapter)),
            inspector: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Set the host inspection callback
    pub fn with_inspector(mut self, inspector: Arc<dyn InspectionCallback>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Replace the envelope adapter
    pub fn with_envelope_adapter(mut self, adapter: Arc<dyn EnvelopeAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Hand capability results to the script unadapted
    pub fn without_envelope_adapter(mut self) -> Self {
        self.adapter = None;
        self
    }

    /// Set the isolate lifecycle observer
    pub fn with_observer(mut self, observer: Arc<dyn IsolateObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The sandbox configuration
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one script against `capabilities`.
    ///
    /// Never fails: every way an invocation can end is an [`InvocationOutcome`].
    /// The script and the full trace are written to the operator log.
    pub async fn run(&self, script: &str, capabilities: &CapabilityTable) -> InvocationReport {
        let invocation_id = Uuid::new_v4();
        let started = Instant::now();
        let trace = ExecutionTrace::new();

        tracing::debug!(
            invocation = %invocation_id,
            capabilities = capabilities.len(),
            timeout_ms = self.config.timeout_ms,
            "Starting sandboxed invocation"
        );

        let invocation = engine::Invocation {
            id: invocation_id,
            script: script.to_string(),
            table: capabilities.clone(),
            config: self.config.clone(),
            adapter: self.adapter.clone(),
            inspector: self.inspector.clone(),
            observer: Arc::clone(&self.observer),
            trace: trace.clone(),
        };

        let outcome = match spawn_invocation(invocation) {
            Ok(receiver) => receiver.await.unwrap_or_else(|_| {
                tracing::error!(
                    invocation = %invocation_id,
                    "Sandbox thread terminated unexpectedly"
                );
                InvocationOutcome::ScriptError(
                    "Sandbox thread terminated unexpectedly".to_string(),
                )
            }),
            Err(message) => InvocationOutcome::SetupError(message),
        };

        let trace = trace.snapshot().await;
        ResultFormatter::log_operator(script, &outcome, &trace);

        let duration = started.elapsed();
        match &outcome {
            InvocationOutcome::Completed(_) | InvocationOutcome::Aborted(_) => tracing::info!(
                invocation = %invocation_id,
                outcome = outcome.kind(),
                calls = trace.len(),
                duration_ms = duration.as_millis() as u64,
                "Invocation complete"
            ),
            _ => tracing::warn!(
                invocation = %invocation_id,
                outcome = outcome.kind(),
                calls = trace.len(),
                duration_ms = duration.as_millis() as u64,
                "Invocation failed"
            ),
        }

        InvocationReport {
            invocation_id,
            outcome,
            trace,
            duration,
        }
    }
}

/// Drive the invocation on a dedicated thread with its own runtime.
///
/// The thread logs through the caller's current subscriber.
fn spawn_invocation(
    invocation: engine::Invocation,
) -> Result<tokio::sync::oneshot::Receiver<InvocationOutcome>, String> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    std::thread::Builder::new()
        .name("ergon-sandbox".to_string())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let outcome = InvocationOutcome::SetupError(format!(
                            "Failed to start sandbox runtime: {e}"
                        ));
                        if tx.send(outcome).is_err() {
                            tracing::warn!("sandbox result receiver dropped");
                        }
                        return;
                    }
                };
                let outcome = runtime.block_on(engine::execute(invocation));
                if tx.send(outcome).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            })
        })
        .map_err(|e| format!("Failed to spawn sandbox thread: {e}"))?;
    Ok(rx)
}
