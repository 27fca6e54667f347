//! Invocation driver
//!
//! Runs on the dedicated sandbox thread. The script's async body, its capability
//! calls and its timers are driven from one loop that settles on the first of:
//! the script resolving, the script rejecting, a bridge reply carrying an abort
//! envelope, or the wall-clock deadline.

use super::isolate::{CallRequest, Isolate, ScriptSettlement, TimerRequest};
use super::lifecycle::{EngineState, IsolateObserver, Lifecycle};
use super::InvocationOutcome;
use crate::abort;
use crate::bridge::{BridgeReply, CapabilityBridge, InspectionCallback};
use crate::capability::{CapabilityError, CapabilityTable, EnvelopeAdapter};
use crate::config::SandboxConfig;
use crate::error::ErgonError;
use crate::trace::ExecutionTrace;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use uuid::Uuid;

/// Everything one invocation needs, moved onto the sandbox thread
pub(crate) struct Invocation {
    pub id: Uuid,
    pub script: String,
    pub table: CapabilityTable,
    pub config: SandboxConfig,
    pub adapter: Option<Arc<dyn EnvelopeAdapter>>,
    pub inspector: Option<Arc<dyn InspectionCallback>>,
    pub observer: Arc<dyn IsolateObserver>,
    pub trace: ExecutionTrace,
}

type PendingReply = LocalBoxFuture<'static, (u32, BridgeReply)>;

/// Run one invocation to its outcome, disposing the isolate exactly once
pub(crate) async fn execute(invocation: Invocation) -> InvocationOutcome {
    let mut lifecycle = Lifecycle::new(invocation.id);
    let deadline = Instant::now() + invocation.config.timeout();

    lifecycle.advance(EngineState::Provisioning);
    let isolate = match Isolate::provision(
        invocation.config.memory_limit_bytes(),
        deadline.into_std(),
    ) {
        Ok(isolate) => isolate,
        Err(error) => {
            let error = ErgonError::Setup(error.to_string());
            tracing::warn!(
                invocation = %invocation.id,
                error = %error,
                "Isolate provisioning failed"
            );
            lifecycle.advance(EngineState::Settled);
            lifecycle.advance(EngineState::Disposed);
            return InvocationOutcome::SetupError(error.to_string());
        }
    };
    invocation.observer.on_provisioned(invocation.id);

    let outcome = match install(&isolate, &invocation) {
        Ok(bridges) => {
            lifecycle.advance(EngineState::Running);
            // A panic in the driver must still reach disposal below
            AssertUnwindSafe(drive(&isolate, &invocation, &bridges, deadline))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(invocation = %invocation.id, "Invocation driver panicked");
                    fault("Invocation driver panicked", deadline, invocation.config.timeout_ms)
                })
        }
        Err(error) => {
            tracing::warn!(invocation = %invocation.id, error = %error, "Binding setup failed");
            InvocationOutcome::SetupError(error.to_string())
        }
    };

    // Settling drops every in-flight capability future and pending timer
    lifecycle.advance(EngineState::Settled);
    tracing::debug!(invocation = %invocation.id, outcome = outcome.kind(), "Invocation settled");

    let clean = isolate.dispose();
    invocation.observer.on_disposed(invocation.id, clean);
    lifecycle.advance(EngineState::Disposed);
    tracing::debug!(
        invocation = %invocation.id,
        state = %lifecycle.state(),
        clean,
        "Isolate released"
    );

    outcome
}

/// Resolve bindings, build one bridge per capability and bootstrap the isolate
fn install(
    isolate: &Isolate,
    invocation: &Invocation,
) -> crate::error::Result<HashMap<String, Arc<CapabilityBridge>>> {
    let bindings = invocation.table.bindings()?;
    let halted = Arc::new(AtomicBool::new(false));

    let identifiers: Vec<String> = bindings.iter().map(|b| b.identifier.clone()).collect();
    let bridges = bindings
        .into_iter()
        .map(|binding| {
            let bridge = CapabilityBridge::new(binding, invocation.trace.clone())
                .with_adapter(invocation.adapter.clone())
                .with_inspector(invocation.inspector.clone())
                .with_halt_flag(Arc::clone(&halted));
            (bridge.identifier().to_string(), Arc::new(bridge))
        })
        .collect();

    isolate
        .install(&identifiers, invocation.config.allow_console_forwarding)
        .map_err(|e| ErgonError::Setup(e.to_string()))?;

    tracing::debug!(
        invocation = %invocation.id,
        capabilities = identifiers.len(),
        "Isolate provisioned"
    );
    Ok(bridges)
}

async fn drive(
    isolate: &Isolate,
    invocation: &Invocation,
    bridges: &HashMap<String, Arc<CapabilityBridge>>,
    deadline: Instant,
) -> InvocationOutcome {
    let timeout_ms = invocation.config.timeout_ms;

    if let Err(error) = isolate.start(&invocation.script) {
        return fault(error, deadline, timeout_ms);
    }

    let mut inflight: FuturesUnordered<PendingReply> = FuturesUnordered::new();
    let mut timers: DelayQueue<u32> = DelayQueue::new();
    let mut timer_keys: HashMap<u32, Key> = HashMap::new();

    loop {
        if let Err(error) = isolate.run_pending_jobs() {
            return fault(error, deadline, timeout_ms);
        }

        if let Some(settlement) = isolate.take_settlement() {
            return match settlement {
                ScriptSettlement::Resolved(json) => match serde_json::from_str::<Value>(&json) {
                    Ok(value) => InvocationOutcome::Completed(value),
                    Err(e) => {
                        InvocationOutcome::ScriptError(format!("Result is not valid JSON: {e}"))
                    }
                },
                ScriptSettlement::Rejected(message) => failure_outcome(message),
            };
        }

        for request in isolate.take_timer_requests() {
            match request {
                TimerRequest::Set { id, delay } => {
                    let key = timers.insert(id, delay);
                    if let Some(previous) = timer_keys.insert(id, key) {
                        timers.remove(&previous);
                    }
                }
                TimerRequest::Clear { id } => {
                    if let Some(key) = timer_keys.remove(&id) {
                        timers.remove(&key);
                    }
                }
            }
        }

        for request in isolate.take_calls() {
            match dispatch(request, bridges) {
                Ok(pending) => inflight.push(pending),
                Err((id, error)) => {
                    if let Err(error) = isolate.settle_call(id, false, failure_payload(&error)) {
                        return fault(error, deadline, timeout_ms);
                    }
                }
            }
        }

        // Settling a call or firing a timer may have queued jobs or new requests
        if isolate.has_pending_work() {
            continue;
        }

        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(deadline) => {
                return InvocationOutcome::TimedOut { timeout_ms };
            }

            Some((id, reply)) = inflight.next(), if !inflight.is_empty() => {
                let delivered = match reply {
                    BridgeReply::Return(value) => {
                        isolate.settle_call(id, true, encode(&value))
                    }
                    BridgeReply::Throw(error) => match abort::decode(&error.message) {
                        Ok(Some(value)) => return InvocationOutcome::Aborted(value),
                        Ok(None) => isolate.settle_call(id, false, failure_payload(&error)),
                        Err(malformed) => {
                            return InvocationOutcome::ScriptError(malformed.to_string());
                        }
                    },
                };
                if let Err(error) = delivered {
                    return fault(error, deadline, timeout_ms);
                }
            }

            Some(expired) = std::future::poll_fn(|cx| timers.poll_expired(cx)),
                if !timers.is_empty() =>
            {
                let id = expired.into_inner();
                timer_keys.remove(&id);
                if let Err(error) = isolate.fire_timer(id) {
                    return fault(error, deadline, timeout_ms);
                }
            }
        }
    }
}

/// Turn a script request into a bridge future
fn dispatch(
    request: CallRequest,
    bridges: &HashMap<String, Arc<CapabilityBridge>>,
) -> Result<PendingReply, (u32, CapabilityError)> {
    let CallRequest {
        id,
        identifier,
        arguments,
    } = request;

    let bridge = bridges
        .get(&identifier)
        .cloned()
        .ok_or_else(|| (id, CapabilityError::new(format!("Unknown capability '{identifier}'"))))?;
    let args: Vec<Value> = serde_json::from_str(&arguments).map_err(|e| {
        (
            id,
            CapabilityError::new(format!("Invalid arguments for '{}': {e}", bridge.name())),
        )
    })?;

    Ok(async move {
        let reply = AssertUnwindSafe(bridge.invoke(args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(capability = %bridge.name(), "Capability panicked");
                BridgeReply::Throw(CapabilityError::new(format!(
                    "Capability '{}' panicked",
                    bridge.name()
                )))
            });
        (id, reply)
    }
    .boxed_local())
}

/// Classify a failure message crossing toward the engine
fn failure_outcome(message: String) -> InvocationOutcome {
    match abort::decode(&message) {
        Ok(Some(value)) => InvocationOutcome::Aborted(value),
        Ok(None) => InvocationOutcome::ScriptError(message),
        Err(malformed) => InvocationOutcome::ScriptError(malformed.to_string()),
    }
}

/// A fault raised by the isolate or the driver. Past the deadline it is the
/// interrupt handler stopping the script, which counts as a timeout.
fn fault(
    error: impl std::fmt::Display,
    deadline: Instant,
    timeout_ms: u64,
) -> InvocationOutcome {
    if Instant::now() >= deadline {
        InvocationOutcome::TimedOut { timeout_ms }
    } else {
        InvocationOutcome::ScriptError(error.to_string())
    }
}

fn encode(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn failure_payload(error: &CapabilityError) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert("message".to_string(), Value::String(error.message.clone()));
    if let Some(data) = &error.payload {
        payload.insert("data".to_string(), data.clone());
    }
    encode(&Value::Object(payload))
}
