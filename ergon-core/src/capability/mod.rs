//! Host capabilities exposed to sandboxed scripts
//!
//! A capability is an asynchronous host operation the script can call by name.
//! This module provides:
//! - The [`Capability`] trait and a closure adapter ([`capability_fn`])
//! - [`CapabilityDefinition`] carrying the description and schemas used by prompt builders
//! - [`CapabilityTable`] for registration, duplicate detection and name sanitization
//! - Envelope adapters that normalize third-party result formats (MCP `tools/call`)
//!
//! # Example
//!
//! ```rust
//! use ergon_core::capability::{capability_fn, CapabilityDefinition, CapabilityTable};
//! use serde_json::json;
//!
//! let mut table = CapabilityTable::new();
//! table
//!     .register(CapabilityDefinition::new(
//!         "getUserLocation",
//!         "Returns the user's city",
//!         capability_fn(|_args| async { Ok(json!("Seattle")) }),
//!     ))
//!     .unwrap();
//! assert!(table.get("getUserLocation").is_some());
//! ```

mod envelope;
mod registry;

pub use envelope::{ContentBlock, EnvelopeAdapter, McpEnvelopeAdapter, ToolCallResult};
pub use registry::{sanitize_identifier, Binding, CapabilityTable, CapabilitySummary, RegistryError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Failure raised by a capability (or by envelope adaptation).
///
/// The message becomes the `message` of the error the script observes; the optional
/// payload is attached to that error as `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct CapabilityError {
    /// Human-readable error message
    pub message: String,

    /// Structured diagnostic payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CapabilityError {
    /// Create a new capability error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a structured payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl From<String> for CapabilityError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CapabilityError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// An asynchronous host operation callable from the sandbox.
///
/// Arguments arrive already normalized: a single JSON value, `{}` when the
/// script passed nothing.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Invoke the capability
    async fn call(&self, args: Value) -> Result<Value, CapabilityError>;
}

struct FnCapability<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<Value, CapabilityError> {
        (self.f)(args).await
    }
}

/// Wrap an async closure as a capability
pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
{
    Arc::new(FnCapability { f })
}

/// A named capability with the shape information consumed by prompt builders.
///
/// The engine itself only needs the handler and, for envelope adaptation, the
/// output schema.
#[derive(Clone)]
pub struct CapabilityDefinition {
    /// Capability name as the host knows it (may contain non-identifier characters)
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// JSON Schema for the input argument
    pub input_schema: Value,

    /// JSON Schema for the result, when declared
    pub output_schema: Option<Value>,

    handler: Arc<dyn Capability>,
}

impl CapabilityDefinition {
    /// Create a definition that accepts any object
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object" }),
            output_schema: None,
            handler,
        }
    }

    /// Set the input schema
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set the output schema
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// The host handler
    pub fn handler(&self) -> &Arc<dyn Capability> {
        &self.handler
    }
}

impl std::fmt::Debug for CapabilityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("has_output_schema", &self.output_schema.is_some())
            .finish()
    }
}
