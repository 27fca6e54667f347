//! Error types for Ergon operations

/// Result type for Ergon operations
pub type Result<T> = std::result::Result<T, ErgonError>;

/// Error types for the Ergon engine
#[derive(Debug, thiserror::Error)]
pub enum ErgonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The isolated context could not be provisioned
    #[error("Sandbox setup error: {0}")]
    Setup(String),

    /// The capability table could not be bound
    #[error("Registry error: {0}")]
    Registry(#[from] crate::capability::RegistryError),
}

/// A rejected invocation.
///
/// `Script` and `Setup` carry the fully formatted report (trace lines included when
/// trace output is enabled) so the calling agent can see which capability call
/// preceded the failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// The script threw or returned a rejected promise
    #[error("{report}")]
    Script {
        /// The thrown message
        message: String,
        /// Formatted result text
        report: String,
    },

    /// The isolated context could not be provisioned
    #[error("{report}")]
    Setup {
        /// The setup failure
        message: String,
        /// Formatted result text
        report: String,
    },

    /// The wall-clock budget elapsed before the script settled
    #[error("Script execution timed out after {timeout_ms}ms")]
    TimedOut {
        /// The configured budget
        timeout_ms: u64,
    },
}

impl ExecutionError {
    /// Whether resubmitting (a corrected script, a larger budget) can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Setup { .. })
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::TimedOut { .. })
    }
}
