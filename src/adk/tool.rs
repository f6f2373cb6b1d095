// SPDX-License-Identifier: MIT

//! Tool transport contract
//!
//! The engine never talks to a tool directly. It asks a `ToolTransport` to
//! call a named tool and hands it an `Elicitor` that the transport invokes
//! whenever the tool needs input from a human mid-call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::adk::error::ToolError;

/// A tool as advertised by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistration {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// One structured call, as authored in a task or produced by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    pub tool_arguments: Value,
}

/// Identity of the invocation a tool runs under.
///
/// Tools use it to scope anything they persist themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallScope {
    pub workflow_id: String,
    pub agent_id: String,
    pub run_id: String,
    pub output_id: String,
}

impl CallScope {
    /// Scope ids rendered as `file://` roots, in a fixed order
    pub fn roots(&self) -> Vec<String> {
        [
            &self.workflow_id,
            &self.agent_id,
            &self.run_id,
            &self.output_id,
        ]
        .iter()
        .map(|id| format!("file://{}", id))
        .collect()
    }
}

/// Answer to an elicitation
#[derive(Debug, Clone, PartialEq)]
pub enum ElicitResponse {
    Accept(Value),
    Cancel,
    Refuse,
}

/// Callback the transport uses to obtain human input
#[async_trait]
pub trait Elicitor: Send + Sync {
    async fn elicit(&self, message: String) -> ElicitResponse;
}

/// Request/response access to external callable tools
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Discover the tools the transport exposes
    async fn list_tools(&self) -> Result<Vec<ToolRegistration>, ToolError>;

    /// Call one tool; the returned value is the tool's JSON payload
    async fn call_tool(
        &self,
        invocation: &ToolInvocation,
        scope: &CallScope,
        elicitor: Arc<dyn Elicitor>,
    ) -> Result<Value, ToolError>;
}
