//! # Ergon - Sandboxed Script Execution for Agents
//!
//! Ergon lets an agent replace a chain of discrete tool calls with one generated
//! script that calls host capabilities directly:
//! - Each script runs in a fresh QuickJS isolate bounded by memory and wall-clock time
//! - Host capabilities are bound as async global functions
//! - Every capability call is recorded in an execution trace
//! - A host inspection callback can rewrite results or abort the script mid-flight
//! - Outcomes are rendered as one deterministic block of text
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ergon_core::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let capabilities = CapabilityTable::new()
//!         .with(CapabilityDefinition::new(
//!             "getUserLocation",
//!             "Returns the user's city",
//!             capability_fn(|_| async { Ok(json!("Seattle")) }),
//!         ))?;
//!
//!     let executor = CodeExecutor::new(SandboxConfig::default());
//!     let text = executor
//!         .execute("return await getUserLocation();", &capabilities, None)
//!         .await?;
//!     assert_eq!(text, "Final result: \"Seattle\"");
//!     Ok(())
//! }
//! ```

pub mod abort;
pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod sandbox;
pub mod trace;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bridge::{Disposition, InspectionCallback, ResultSignal};
    pub use crate::capability::{
        capability_fn, Capability, CapabilityDefinition, CapabilityError, CapabilityTable,
        EnvelopeAdapter, McpEnvelopeAdapter, ToolCallResult,
    };
    pub use crate::config::{ErgonConfig, SandboxConfig};
    pub use crate::error::{ErgonError, ExecutionError, Result};
    pub use crate::executor::CodeExecutor;
    pub use crate::format::ResultFormatter;
    pub use crate::sandbox::{
        InvocationOutcome, InvocationReport, IsolateObserver, NoopObserver, SandboxEngine,
    };
    pub use crate::trace::{ExecutionTrace, TraceEntry, TraceOutcome};
}
