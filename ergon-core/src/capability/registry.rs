//! Capability table: registration, lookup and sandbox binding names
//!
//! Capability names come from the host (often MCP tool names such as
//! `github.create-issue`) and are not necessarily valid script identifiers. Each
//! name is sanitized to an identifier for the sandbox's global scope while the
//! original is kept for everything the host sees.

use super::{Capability, CapabilityDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Words that cannot be bound as global identifiers
const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "arguments",
    "eval", "undefined", "NaN", "Infinity",
];

/// Globals the sandbox installs itself
const SANDBOX_GLOBALS: &[&str] = &[
    "console",
    "setTimeout",
    "clearTimeout",
    "globalThis",
    "Function",
];

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// A capability with this exact name already exists
    #[error("Capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// Two capabilities sanitize to the same script identifier
    #[error("Capabilities '{first}' and '{second}' both map to the identifier '{identifier}'")]
    IdentifierCollision {
        /// Identifier in the sandbox scope
        identifier: String,
        /// First registered name
        first: String,
        /// Conflicting name
        second: String,
    },

    /// Capability not found
    #[error("Capability '{0}' not found")]
    NotFound(String),
}

/// Convert a host capability name into an identifier valid in the sandbox scope.
///
/// Characters outside `[A-Za-z0-9_$]` become `_`, a leading digit gets a `_` prefix and
/// reserved words or sandbox globals get a `_` suffix.
pub fn sanitize_identifier(name: &str) -> String {
    let mut identifier: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if identifier.is_empty() {
        return "_".to_string();
    }
    if identifier.starts_with(|c: char| c.is_ascii_digit()) {
        identifier.insert(0, '_');
    }
    if RESERVED_WORDS.contains(&identifier.as_str())
        || SANDBOX_GLOBALS.contains(&identifier.as_str())
        || identifier.starts_with("__ergon")
    {
        identifier.push('_');
    }
    identifier
}

/// One capability as bound into a single invocation
#[derive(Clone)]
pub struct Binding {
    /// Original name, used for the trace and the inspection callback
    pub name: String,

    /// Identifier exposed in the sandbox's global scope
    pub identifier: String,

    /// Declared output schema, forwarded to the envelope adapter
    pub output_schema: Option<Value>,

    /// Host handler
    pub handler: Arc<dyn Capability>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Summary of a capability for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySummary {
    /// Capability name
    pub name: String,
    /// Script identifier
    pub identifier: String,
    /// Description
    pub description: String,
}

/// Registry of capabilities available to an invocation.
///
/// Registration order is preserved; it is the order bindings are installed in.
#[derive(Default, Clone)]
pub struct CapabilityTable {
    definitions: Vec<CapabilityDefinition>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("capability_count", &self.definitions.len())
            .field(
                "capabilities",
                &self.definitions.iter().map(|d| &d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CapabilityTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability
    pub fn register(&mut self, definition: CapabilityDefinition) -> Result<(), RegistryError> {
        if self.by_name.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateCapability(definition.name));
        }
        self.by_name
            .insert(definition.name.clone(), self.definitions.len());
        self.definitions.push(definition);
        Ok(())
    }

    /// Register a capability, builder style
    pub fn with(mut self, definition: CapabilityDefinition) -> Result<Self, RegistryError> {
        self.register(definition)?;
        Ok(self)
    }

    /// Remove a capability
    pub fn unregister(&mut self, name: &str) -> Result<CapabilityDefinition, RegistryError> {
        let index = self
            .by_name
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let definition = self.definitions.remove(index);
        for slot in self.by_name.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Ok(definition)
    }

    /// Look up a capability by its original name
    pub fn get(&self, name: &str) -> Option<&CapabilityDefinition> {
        self.by_name.get(name).map(|&i| &self.definitions[i])
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Iterate definitions in registration order
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityDefinition> {
        self.definitions.iter()
    }

    /// Summaries for listing
    pub fn summaries(&self) -> Vec<CapabilitySummary> {
        self.definitions
            .iter()
            .map(|d| CapabilitySummary {
                name: d.name.clone(),
                identifier: sanitize_identifier(&d.name),
                description: d.description.clone(),
            })
            .collect()
    }

    /// Produce the bindings for one invocation.
    ///
    /// Fails when two names sanitize to the same identifier; neither is silently
    /// shadowed.
    pub fn bindings(&self) -> Result<Vec<Binding>, RegistryError> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        let mut bindings = Vec::with_capacity(self.definitions.len());

        for definition in &self.definitions {
            let identifier = sanitize_identifier(&definition.name);
            if let Some(first) = seen.get(&identifier) {
                return Err(RegistryError::IdentifierCollision {
                    identifier,
                    first: first.to_string(),
                    second: definition.name.clone(),
                });
            }
            seen.insert(identifier.clone(), &definition.name);
            bindings.push(Binding {
                name: definition.name.clone(),
                identifier,
                output_schema: definition.output_schema.clone(),
                handler: Arc::clone(definition.handler()),
            });
        }

        Ok(bindings)
    }
}
