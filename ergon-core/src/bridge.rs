//! Capability bridge
//!
//! Mediates one sandbox-to-host capability call:
//! 1. Normalize the script's arguments (no arguments become `{}`)
//! 2. Invoke the host capability
//! 3. Unwrap a recognized result envelope
//! 4. Record the call in the execution trace
//! 5. Offer the value to the host inspection callback, which may replace it or
//!    abort the whole invocation
//!
//! Adaptation runs before inspection so the callback never sees a transport
//! envelope. An abort leaves the bridge as an ordinary failure whose message is
//! an abort envelope.

use crate::abort;
use crate::capability::{Binding, CapabilityError, EnvelopeAdapter};
use crate::trace::{ExecutionTrace, TraceEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What the host wants after inspecting a capability result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Hand the value back to the script
    Continue,
    /// Terminate the script; the value becomes the invocation's result
    Abort,
}

/// Returned by the inspection callback after each capability call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSignal {
    pub disposition: Disposition,
    pub value: Value,
}

impl ResultSignal {
    /// Continue with `value` (which may differ from what the capability returned)
    pub fn proceed(value: Value) -> Self {
        Self {
            disposition: Disposition::Continue,
            value,
        }
    }

    /// Abort the invocation with `value` as its result
    pub fn abort(value: Value) -> Self {
        Self {
            disposition: Disposition::Abort,
            value,
        }
    }

    /// Whether this signal aborts
    pub fn is_abort(&self) -> bool {
        self.disposition == Disposition::Abort
    }
}

/// Host-side hook consulted after every capability call.
///
/// Runs synchronously on the critical path of each call, so it must not block.
pub trait InspectionCallback: Send + Sync {
    /// Inspect a successful (already adapted) result
    fn inspect(&self, capability: &str, value: &Value, arguments: &Value) -> ResultSignal;

    /// Optionally override a failed call. `None` re-throws the failure into the script.
    fn inspect_error(
        &self,
        _capability: &str,
        _error: &CapabilityError,
        _arguments: &Value,
    ) -> Option<ResultSignal> {
        None
    }
}

impl<F> InspectionCallback for F
where
    F: Fn(&str, &Value, &Value) -> ResultSignal + Send + Sync,
{
    fn inspect(&self, capability: &str, value: &Value, arguments: &Value) -> ResultSignal {
        self(capability, value, arguments)
    }
}

/// Result of a bridged call as delivered back toward the sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeReply {
    /// Resolve the script's pending call with this value
    Return(Value),
    /// Reject the script's pending call with this error
    Throw(CapabilityError),
}

impl BridgeReply {
    /// The abort payload, when this reply carries an abort envelope
    pub fn abort_value(&self) -> Option<Value> {
        match self {
            BridgeReply::Throw(error) => abort::decode(&error.message).ok().flatten(),
            BridgeReply::Return(_) => None,
        }
    }
}

/// Normalize the argument list a script passed to a capability.
///
/// No arguments become a single empty object, one argument is passed as is and
/// several are passed as an array.
pub fn normalize_arguments(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Object(serde_json::Map::new()),
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

/// Wraps one bound capability for calls from the sandbox
pub struct CapabilityBridge {
    binding: Binding,
    trace: ExecutionTrace,
    adapter: Option<Arc<dyn EnvelopeAdapter>>,
    inspector: Option<Arc<dyn InspectionCallback>>,
    halted: Arc<AtomicBool>,
}

impl std::fmt::Debug for CapabilityBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityBridge")
            .field("capability", &self.binding.name)
            .field("identifier", &self.binding.identifier)
            .field("has_adapter", &self.adapter.is_some())
            .field("has_inspector", &self.inspector.is_some())
            .finish()
    }
}

impl CapabilityBridge {
    /// Create a bridge recording into `trace`
    pub fn new(binding: Binding, trace: ExecutionTrace) -> Self {
        Self {
            binding,
            trace,
            adapter: None,
            inspector: None,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the envelope adapter
    pub fn with_adapter(mut self, adapter: Option<Arc<dyn EnvelopeAdapter>>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Set the inspection callback
    pub fn with_inspector(mut self, inspector: Option<Arc<dyn InspectionCallback>>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Share a halt flag with the other bridges of the invocation.
    ///
    /// Once any bridge aborts, every bridge sharing the flag refuses further calls.
    pub fn with_halt_flag(mut self, halted: Arc<AtomicBool>) -> Self {
        self.halted = halted;
        self
    }

    /// Original capability name
    pub fn name(&self) -> &str {
        &self.binding.name
    }

    /// Identifier bound in the sandbox
    pub fn identifier(&self) -> &str {
        &self.binding.identifier
    }

    /// Run one call from the sandbox
    pub async fn invoke(&self, args: Vec<Value>) -> BridgeReply {
        if self.halted.load(Ordering::SeqCst) {
            return BridgeReply::Throw(CapabilityError::new("Execution was aborted by the host"));
        }

        let arguments = normalize_arguments(args);
        let started = Instant::now();

        let result = self
            .binding
            .handler
            .call(arguments.clone())
            .await
            .and_then(|raw| self.adapt(raw));
        let duration = started.elapsed();

        match result {
            Ok(value) => {
                self.trace
                    .record(
                        TraceEntry::value(&self.binding.name, arguments.clone(), value.clone())
                            .with_duration(duration),
                    )
                    .await;

                match &self.inspector {
                    Some(inspector) => {
                        let signal = inspector.inspect(&self.binding.name, &value, &arguments);
                        self.apply(signal)
                    }
                    None => BridgeReply::Return(value),
                }
            }
            Err(error) => {
                tracing::debug!(
                    capability = %self.binding.name,
                    error = %error,
                    "Capability call failed"
                );
                self.trace
                    .record(
                        TraceEntry::error(&self.binding.name, arguments.clone(), &error.message)
                            .with_duration(duration),
                    )
                    .await;

                let signal = self
                    .inspector
                    .as_ref()
                    .and_then(|inspector| {
                        inspector.inspect_error(&self.binding.name, &error, &arguments)
                    });
                match signal {
                    Some(signal) => self.apply(signal),
                    None => BridgeReply::Throw(error),
                }
            }
        }
    }

    fn adapt(&self, raw: Value) -> Result<Value, CapabilityError> {
        match &self.adapter {
            Some(adapter) if adapter.recognizes(&raw) => {
                adapter.adapt(raw, self.binding.output_schema.as_ref())
            }
            _ => Ok(raw),
        }
    }

    fn apply(&self, signal: ResultSignal) -> BridgeReply {
        match signal.disposition {
            Disposition::Continue => BridgeReply::Return(signal.value),
            Disposition::Abort => {
                self.halted.store(true, Ordering::SeqCst);
                tracing::info!(
                    capability = %self.binding.name,
                    "Host inspection requested abort"
                );
                BridgeReply::Throw(CapabilityError::new(abort::encode(&signal.value)))
            }
        }
    }
}
