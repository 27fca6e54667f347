//! Fixture-backed capabilities
//!
//! A fixture file maps capability names to canned behavior so scripts can be run
//! without live host services:
//!
//! ```json
//! {
//!   "getUserLocation": { "description": "User's city", "returns": "Seattle" },
//!   "getWeather": { "returns": { "temperature": 65 }, "delay_ms": 50 },
//!   "fetchRecord": { "error": "not found", "error_data": { "code": 404 } }
//! }
//! ```

use ergon_core::capability::{capability_fn, CapabilityDefinition, CapabilityError, CapabilityTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Canned behavior for one capability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureCapability {
    /// Description shown in listings
    #[serde(default)]
    pub description: String,

    /// Value returned on success
    #[serde(default)]
    pub returns: Option<Value>,

    /// Fail with this message instead of returning
    #[serde(default)]
    pub error: Option<String>,

    /// Structured payload attached to the failure
    #[serde(default)]
    pub error_data: Option<Value>,

    /// Simulated latency
    #[serde(default)]
    pub delay_ms: Option<u64>,

    /// Declared input schema
    #[serde(default)]
    pub input_schema: Option<Value>,

    /// Declared output schema
    #[serde(default)]
    pub output_schema: Option<Value>,
}

impl FixtureCapability {
    fn into_definition(self, name: &str) -> CapabilityDefinition {
        let FixtureCapability {
            description,
            returns,
            error,
            error_data,
            delay_ms,
            input_schema,
            output_schema,
        } = self;

        let handler = capability_fn(move |_args| {
            let returns = returns.clone();
            let error = error.clone();
            let error_data = error_data.clone();
            async move {
                if let Some(delay) = delay_ms {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                match error {
                    Some(message) => {
                        let mut failure = CapabilityError::new(message);
                        if let Some(data) = error_data {
                            failure = failure.with_payload(data);
                        }
                        Err(failure)
                    }
                    None => Ok(returns.unwrap_or(Value::Null)),
                }
            }
        });

        let mut definition = CapabilityDefinition::new(name, description, handler);
        if let Some(schema) = input_schema {
            definition = definition.with_input_schema(schema);
        }
        if let Some(schema) = output_schema {
            definition = definition.with_output_schema(schema);
        }
        definition
    }
}

/// Parse fixture JSON into a capability table, in file order
pub fn parse(content: &str) -> anyhow::Result<CapabilityTable> {
    let entries: serde_json::Map<String, Value> = serde_json::from_str(content)?;
    let mut table = CapabilityTable::new();
    for (name, entry) in entries {
        let capability: FixtureCapability = serde_json::from_value(entry)
            .map_err(|e| anyhow::anyhow!("Invalid fixture for '{}': {}", name, e))?;
        table.register(capability.into_definition(&name))?;
    }
    Ok(table)
}

/// Load a fixture file
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<CapabilityTable> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read fixtures {}: {}", path.display(), e))?;
    parse(&content)
}
