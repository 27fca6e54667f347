//! Isolated execution context
//!
//! One QuickJS runtime and context per invocation. The script reaches the host
//! only through a handful of synchronous hook functions that record requests into
//! [`HostState`]; the engine drains those requests between turns of the job queue.
//! Everything crossing the boundary is JSON text.

use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime};
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Log target for forwarded sandbox console output
pub const CONSOLE_TARGET: &str = "ergon::console";

const BOOTSTRAP: &str = include_str!("bootstrap.js");
const MAX_STACK_SIZE: usize = 1024 * 1024;

/// Errors raised while provisioning or driving an isolate
#[derive(Debug, thiserror::Error)]
pub(crate) enum IsolateError {
    /// The runtime, context or bindings could not be set up
    #[error("{0}")]
    Provision(String),

    /// Script code raised an exception the bootstrap could not route
    #[error("{0}")]
    Script(String),
}

/// A capability call requested by the script
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallRequest {
    pub id: u32,
    pub identifier: String,
    pub arguments: String,
}

/// A timer change requested by the script
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerRequest {
    Set { id: u32, delay: Duration },
    Clear { id: u32 },
}

/// How the script's async body settled
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScriptSettlement {
    /// JSON encoding of the returned value
    Resolved(String),
    /// Message of the thrown value
    Rejected(String),
}

/// Requests written by the host hooks, drained by the engine
#[derive(Debug, Default)]
pub(crate) struct HostState {
    calls: Vec<CallRequest>,
    timers: Vec<TimerRequest>,
    settlement: Option<ScriptSettlement>,
    settled: bool,
}

impl HostState {
    /// Record the settlement; only the first one counts
    fn settle(&mut self, settlement: ScriptSettlement) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.settlement = Some(settlement);
    }
}

/// A provisioned runtime and context.
///
/// Field order matters: the entry hooks must be released before the context, and
/// the context before its runtime.
pub(crate) struct Isolate {
    entry: RefCell<Option<Persistent<Object<'static>>>>,
    context: Option<Context>,
    runtime: Option<Runtime>,
    host: Rc<RefCell<HostState>>,
    deadline: Instant,
}

impl Isolate {
    /// Allocate a runtime and context bounded by `memory_limit` bytes.
    ///
    /// The interrupt handler stops script code once `deadline` has passed.
    pub(crate) fn provision(memory_limit: u64, deadline: Instant) -> Result<Self, IsolateError> {
        let runtime = Runtime::new()
            .map_err(|e| IsolateError::Provision(format!("Failed to create runtime: {e}")))?;
        runtime.set_memory_limit(usize::try_from(memory_limit).unwrap_or(usize::MAX));
        runtime.set_max_stack_size(MAX_STACK_SIZE);
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

        let context = Context::full(&runtime)
            .map_err(|e| IsolateError::Provision(format!("Failed to create context: {e}")))?;

        Ok(Self {
            entry: RefCell::new(None),
            context: Some(context),
            runtime: Some(runtime),
            host: Rc::new(RefCell::new(HostState::default())),
            deadline,
        })
    }

    /// Install the console, timers, capability callables and the script entry point
    pub(crate) fn install(
        &self,
        identifiers: &[String],
        console_forwarding: bool,
    ) -> Result<(), IsolateError> {
        let bindings = serde_json::to_string(identifiers)
            .map_err(|e| IsolateError::Provision(format!("Failed to encode bindings: {e}")))?;
        let host = Rc::clone(&self.host);
        let deadline = self.deadline;
        let entry = &self.entry;

        self.with_context(move |ctx| {
            let globals = ctx.globals();

            let calls = Rc::clone(&host);
            globals.set(
                "__ergon_host_call",
                Function::new(ctx.clone(), move |id: u32, identifier: String, arguments: String| {
                    calls.borrow_mut().calls.push(CallRequest {
                        id,
                        identifier,
                        arguments,
                    });
                })?,
            )?;

            globals.set(
                "__ergon_host_console",
                Function::new(ctx.clone(), move |level: String, text: String| {
                    if console_forwarding {
                        forward_console(&level, &text);
                    }
                })?,
            )?;

            let timers = Rc::clone(&host);
            globals.set(
                "__ergon_host_timer_set",
                Function::new(ctx.clone(), move |id: u32, delay_ms: f64| {
                    timers.borrow_mut().timers.push(TimerRequest::Set {
                        id,
                        delay: delay_from_millis(delay_ms, deadline),
                    });
                })?,
            )?;

            let timers = Rc::clone(&host);
            globals.set(
                "__ergon_host_timer_clear",
                Function::new(ctx.clone(), move |id: u32| {
                    timers.borrow_mut().timers.push(TimerRequest::Clear { id });
                })?,
            )?;

            let resolved = Rc::clone(&host);
            globals.set(
                "__ergon_host_resolve",
                Function::new(ctx.clone(), move |value: String| {
                    resolved
                        .borrow_mut()
                        .settle(ScriptSettlement::Resolved(value));
                })?,
            )?;

            let rejected = Rc::clone(&host);
            globals.set(
                "__ergon_host_reject",
                Function::new(ctx.clone(), move |message: String| {
                    rejected
                        .borrow_mut()
                        .settle(ScriptSettlement::Rejected(message));
                })?,
            )?;

            globals.set("__ergon_bindings", bindings)?;
            let hooks: Object<'_> = ctx.eval(BOOTSTRAP)?;
            *entry.borrow_mut() = Some(Persistent::save(ctx, hooks));
            Ok(())
        })
        .map_err(|e| IsolateError::Provision(format!("Failed to install bindings: {e}")))
    }

    /// Submit the script body for asynchronous execution
    pub(crate) fn start(&self, script: &str) -> Result<(), IsolateError> {
        let entry = self.entry_hooks()?;
        let source = script.to_string();
        self.with_context(move |ctx| {
            let run: Function<'_> = entry.restore(ctx)?.get("run")?;
            run.call::<_, ()>((source,))
        })
    }

    /// Deliver a capability reply to the pending call `id`
    pub(crate) fn settle_call(
        &self,
        id: u32,
        ok: bool,
        payload: String,
    ) -> Result<(), IsolateError> {
        let entry = self.entry_hooks()?;
        self.with_context(move |ctx| {
            let settle: Function<'_> = entry.restore(ctx)?.get("settleCall")?;
            settle.call::<_, ()>((id, ok, payload))
        })
    }

    /// Run the callback of timer `id`
    pub(crate) fn fire_timer(&self, id: u32) -> Result<(), IsolateError> {
        let entry = self.entry_hooks()?;
        self.with_context(move |ctx| {
            let fire: Function<'_> = entry.restore(ctx)?.get("fireTimer")?;
            fire.call::<_, ()>((id,))
        })
    }

    /// Hooks returned by the bootstrap; never reachable from script code
    fn entry_hooks(&self) -> Result<Persistent<Object<'static>>, IsolateError> {
        self.entry
            .borrow()
            .clone()
            .ok_or_else(|| IsolateError::Script("Isolate has no entry point installed".to_string()))
    }

    /// Drain the microtask queue
    pub(crate) fn run_pending_jobs(&self) -> Result<(), IsolateError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| IsolateError::Script("Isolate already disposed".to_string()))?;
        loop {
            match runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(exception) => {
                    let message = exception
                        .0
                        .with(|ctx| exception_message(&ctx, rquickjs::Error::Exception));
                    return Err(IsolateError::Script(message));
                }
            }
        }
    }

    /// Whether jobs or host requests are waiting to be processed
    pub(crate) fn has_pending_work(&self) -> bool {
        let jobs = self
            .runtime
            .as_ref()
            .is_some_and(|runtime| runtime.is_job_pending());
        let host = self.host.borrow();
        jobs || !host.calls.is_empty() || !host.timers.is_empty() || host.settlement.is_some()
    }

    pub(crate) fn take_calls(&self) -> Vec<CallRequest> {
        std::mem::take(&mut self.host.borrow_mut().calls)
    }

    pub(crate) fn take_timer_requests(&self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.host.borrow_mut().timers)
    }

    pub(crate) fn take_settlement(&self) -> Option<ScriptSettlement> {
        self.host.borrow_mut().settlement.take()
    }

    /// Release the context and runtime. Returns false when teardown faulted;
    /// the fault itself is swallowed.
    pub(crate) fn dispose(mut self) -> bool {
        let entry = self.entry.get_mut().take();
        let context = self.context.take();
        let runtime = self.runtime.take();
        let clean = std::panic::catch_unwind(AssertUnwindSafe(move || {
            drop(entry);
            drop(context);
            drop(runtime);
        }))
        .is_ok();
        if !clean {
            tracing::warn!("Isolate teardown panicked");
        }
        clean
    }

    fn with_context<F>(&self, f: F) -> Result<(), IsolateError>
    where
        F: FnOnce(&Ctx<'_>) -> rquickjs::Result<()>,
    {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| IsolateError::Script("Isolate already disposed".to_string()))?;
        context.with(|ctx| {
            f(&ctx).map_err(|error| IsolateError::Script(exception_message(&ctx, error)))
        })
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("live", &self.context.is_some())
            .finish()
    }
}

/// Pull the pending exception's message out of the context
fn exception_message(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !matches!(error, rquickjs::Error::Exception) {
        return error.to_string();
    }
    let caught = ctx.catch();
    if let Some(exception) = caught.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "Uncaught exception".to_string());
    }
    caught
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "Uncaught exception".to_string())
}

/// A script timer delay, capped at the time left before `deadline`.
///
/// Timers due after the deadline can never fire, and the host timer wheel
/// rejects delays far in the future.
fn delay_from_millis(delay_ms: f64, deadline: Instant) -> Duration {
    let requested = if delay_ms.is_finite() && delay_ms > 0.0 {
        Duration::from_millis(delay_ms as u64)
    } else {
        Duration::ZERO
    };
    requested.min(deadline.saturating_duration_since(Instant::now()))
}

fn forward_console(level: &str, text: &str) {
    match level {
        "error" => tracing::error!(target: CONSOLE_TARGET, "{text}"),
        "warn" => tracing::warn!(target: CONSOLE_TARGET, "{text}"),
        "info" | "log" => tracing::info!(target: CONSOLE_TARGET, "{text}"),
        _ => tracing::debug!(target: CONSOLE_TARGET, "{text}"),
    }
}
