// SPDX-License-Identifier: MIT

//! Typed error handling for agentgraph-rs
//!
//! `FlowError` is what engine and workflow operations return. Collaborator
//! failures (graph store, text generation, tool transport) keep their own
//! enums and convert into it with `?`.

use thiserror::Error;

/// Top-level error type for agentgraph-rs
#[derive(Debug, Error)]
pub enum FlowError {
    /// Graph store failures (surfaced to the caller of mutating operations)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Text generation failures
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Tool transport failures
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// A workflow, agent or run context that does not exist
    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    /// An agent was invoked before every INPUT-linked output exists
    #[error("a prerequisite input is missing")]
    NotReady,

    /// The model produced something that is not a tool call list
    #[error("Invalid tool call list: {0}")]
    InvalidToolCalls(String),

    /// Feedback could not be routed to a waiter
    #[error("Feedback error: {0}")]
    Feedback(String),

    /// The outbound side of the event pipe is gone
    #[error("Event pipe closed")]
    PipeClosed,

    /// The run was aborted while this operation was suspended
    #[error("Run cancelled")]
    Cancelled,

    /// Configuration errors (missing env vars, invalid config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error wrapper
    #[error("{0}")]
    Other(String),
}

/// Graph store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No node matched the given label/properties
    #[error("no {label} node matches {id}")]
    NotFound { label: String, id: String },

    /// A uniqueness or shape constraint was violated
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The backend itself failed
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Model/LLM-specific errors
#[derive(Debug, Error)]
pub enum ModelError {
    /// API key not configured
    #[error("API key not configured for provider: {0}")]
    ApiKeyMissing(String),

    /// Transport-level failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Provider answered with an error status
    #[error("API error from {provider}: {message}")]
    Api { provider: String, message: String },

    /// Invalid response from model
    #[error("Invalid response from model: {0}")]
    InvalidResponse(String),
}

/// Tool transport errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool not registered with the transport
    #[error("Tool '{0}' not found")]
    NotFound(String),

    /// The transport could not be started or broke mid-call
    #[error("transport failure: {0}")]
    Transport(String),

    /// The tool itself reported failure
    #[error("tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },

    /// The tool answered with something that is not a JSON payload
    #[error("invalid payload from '{tool}': {message}")]
    InvalidPayload { tool: String, message: String },
}

/// Result alias used throughout the crate
pub type Result<T, E = FlowError> = std::result::Result<T, E>;

impl FlowError {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create from a generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<&str> for FlowError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for FlowError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl StoreError {
    pub fn not_found(label: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            label: label.into(),
            id: id.into(),
        }
    }
}
