//! Text-in, text-out invocation API
//!
//! [`CodeExecutor`] is what an agent's "execute code" tool calls: it runs the
//! submitted script and returns the formatted result text, or rejects with an
//! [`ExecutionError`] carrying that text.

use crate::bridge::InspectionCallback;
use crate::capability::{CapabilityTable, EnvelopeAdapter};
use crate::config::SandboxConfig;
use crate::error::ExecutionError;
use crate::format::ResultFormatter;
use crate::sandbox::{InvocationOutcome, IsolateObserver, SandboxEngine};
use std::sync::Arc;

/// Executes scripts and renders their outcome as text
#[derive(Debug, Clone)]
pub struct CodeExecutor {
    engine: SandboxEngine,
}

impl CodeExecutor {
    /// Create an executor with default engine settings for `config`
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            engine: SandboxEngine::new(config),
        }
    }

    /// Wrap an already configured engine
    pub fn from_engine(engine: SandboxEngine) -> Self {
        Self { engine }
    }

    /// Set the host inspection callback
    pub fn with_inspector(mut self, inspector: Arc<dyn InspectionCallback>) -> Self {
        self.engine = self.engine.with_inspector(inspector);
        self
    }

    /// Replace the envelope adapter
    pub fn with_envelope_adapter(mut self, adapter: Arc<dyn EnvelopeAdapter>) -> Self {
        self.engine = self.engine.with_envelope_adapter(adapter);
        self
    }

    /// Disable envelope adaptation
    pub fn without_envelope_adapter(mut self) -> Self {
        self.engine = self.engine.without_envelope_adapter();
        self
    }

    /// Set the isolate lifecycle observer
    pub fn with_observer(mut self, observer: Arc<dyn IsolateObserver>) -> Self {
        self.engine = self.engine.with_observer(observer);
        self
    }

    /// The underlying engine
    pub fn engine(&self) -> &SandboxEngine {
        &self.engine
    }

    /// Run `script` against `capabilities` and format the outcome.
    ///
    /// `include_trace` overrides the configured `include_trace_in_output` for this
    /// call. Completed and aborted invocations fulfill; everything else rejects.
    ///
    /// # Errors
    ///
    /// - [`ExecutionError::Script`] when the script throws
    /// - [`ExecutionError::Setup`] when the isolate or bindings cannot be set up
    /// - [`ExecutionError::TimedOut`] when the wall-clock budget elapses
    pub async fn execute(
        &self,
        script: &str,
        capabilities: &CapabilityTable,
        include_trace: Option<bool>,
    ) -> Result<String, ExecutionError> {
        let include_trace =
            include_trace.unwrap_or(self.engine.config().include_trace_in_output);
        let formatter = ResultFormatter::new(include_trace);

        let report = self.engine.run(script, capabilities).await;
        let text = formatter.render(&report.outcome, &report.trace);

        match report.outcome {
            InvocationOutcome::Completed(_) | InvocationOutcome::Aborted(_) => Ok(text),
            InvocationOutcome::ScriptError(message) => Err(ExecutionError::Script {
                message,
                report: text,
            }),
            InvocationOutcome::SetupError(message) => Err(ExecutionError::Setup {
                message,
                report: text,
            }),
            InvocationOutcome::TimedOut { timeout_ms } => {
                Err(ExecutionError::TimedOut { timeout_ms })
            }
        }
    }
}
