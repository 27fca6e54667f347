//! Invocation lifecycle states and isolate observers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing allocated yet
    Idle,

    /// Creating the isolate and installing bindings
    Provisioning,

    /// The script is executing
    Running,

    /// An outcome has been decided; later signals are ignored
    Settled,

    /// Isolate resources released (terminal)
    Disposed,
}

impl EngineState {
    /// Whether `next` is a legal successor of this state
    pub fn can_advance_to(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Settled)
                | (Running, Settled)
                | (Settled, Disposed)
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Provisioning => "provisioning",
            EngineState::Running => "running",
            EngineState::Settled => "settled",
            EngineState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one invocation and logs every transition
#[derive(Debug)]
pub(crate) struct Lifecycle {
    invocation: Uuid,
    state: EngineState,
}

impl Lifecycle {
    pub(crate) fn new(invocation: Uuid) -> Self {
        Self {
            invocation,
            state: EngineState::Idle,
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        self.state
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub(crate) fn advance(&mut self, next: EngineState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                invocation = %self.invocation,
                from = %self.state,
                to = %next,
                "Ignoring illegal lifecycle transition"
            );
            return false;
        }
        tracing::debug!(
            invocation = %self.invocation,
            from = %self.state,
            to = %next,
            "Invocation state changed"
        );
        self.state = next;
        true
    }
}

/// Notified when isolate resources are allocated and released.
///
/// Disposal is reported exactly once for every provisioned isolate, whatever the
/// outcome. Callbacks run on the sandbox thread and must not block.
pub trait IsolateObserver: Send + Sync {
    /// An isolate was allocated for `invocation`
    fn on_provisioned(&self, _invocation: Uuid) {}

    /// The isolate for `invocation` was released. `clean` is false when teardown
    /// faulted (the fault itself is swallowed).
    fn on_disposed(&self, _invocation: Uuid, _clean: bool) {}
}

/// Observer that ignores every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl IsolateObserver for NoopObserver {}
