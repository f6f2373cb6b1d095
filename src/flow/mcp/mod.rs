// SPDX-License-Identifier: MIT

//! MCP tool transport over a child process (stdio)
//!
//! Every agent invocation gets its own client session, so the roots the
//! server sees are exactly that invocation's scope and elicitations reach
//! the right agent.

use rmcp::model::{
    CallToolRequestParam, ClientCapabilities, ClientInfo, CreateElicitationRequestParam,
    CreateElicitationResult, Implementation, ListRootsResult,
};
use rmcp::service::{RequestContext, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::{ClientHandler, ErrorData as McpError, ServiceExt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::process::Command;

use crate::adk::error::ToolError;
use crate::adk::tool::{
    CallScope, ElicitResponse, Elicitor, ToolInvocation, ToolRegistration, ToolTransport,
};

/// How to start the MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Client side of one session: answers `roots/list` and forwards
/// `elicitation/create`
pub struct ScopedClientHandler {
    roots: Vec<String>,
    elicitor: Option<Arc<dyn Elicitor>>,
}

impl ScopedClientHandler {
    pub fn new(roots: Vec<String>, elicitor: Option<Arc<dyn Elicitor>>) -> Self {
        Self { roots, elicitor }
    }

    fn roots_result(&self) -> Result<ListRootsResult, McpError> {
        let roots: Vec<Value> = self
            .roots
            .iter()
            .map(|uri| json!({ "uri": uri }))
            .collect();
        serde_json::from_value(json!({ "roots": roots }))
            .map_err(|e| McpError::internal_error(e.to_string(), None))
    }
}

fn elicitation_result(response: ElicitResponse) -> Result<CreateElicitationResult, McpError> {
    let body = match response {
        ElicitResponse::Accept(content) => {
            let content = match content {
                Value::Object(_) => content,
                Value::Null => json!({}),
                other => json!({ "response": other }),
            };
            json!({ "action": "accept", "content": content })
        }
        ElicitResponse::Refuse => json!({ "action": "decline" }),
        ElicitResponse::Cancel => json!({ "action": "cancel" }),
    };
    serde_json::from_value(body).map_err(|e| McpError::internal_error(e.to_string(), None))
}

impl ClientHandler for ScopedClientHandler {
    fn get_info(&self) -> ClientInfo {
        let capabilities: ClientCapabilities = serde_json::from_value(json!({
            "elicitation": {},
            "roots": { "listChanged": false }
        }))
        .unwrap_or_default();
        ClientInfo {
            protocol_version: Default::default(),
            capabilities,
            client_info: Implementation {
                name: "agentgraph-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }

    fn list_roots(
        &self,
        _context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<ListRootsResult, McpError>> + Send + '_ {
        async move { self.roots_result() }
    }

    fn create_elicitation(
        &self,
        request: CreateElicitationRequestParam,
        _context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<CreateElicitationResult, McpError>> + Send + '_ {
        async move {
            let response = match &self.elicitor {
                Some(elicitor) => elicitor.elicit(request.message).await,
                None => {
                    log::warn!("Elicitation outside an agent invocation, cancelling");
                    ElicitResponse::Cancel
                }
            };
            elicitation_result(response)
        }
    }
}

type McpSession = RunningService<RoleClient, ScopedClientHandler>;

/// Spawn the server process and complete the MCP handshake
pub async fn connect(
    config: &McpServerConfig,
    handler: ScopedClientHandler,
) -> Result<McpSession, ToolError> {
    let mut server_cmd = Command::new(&config.command);
    server_cmd.args(&config.args);

    let transport = TokioChildProcess::new(server_cmd)
        .map_err(|e| ToolError::Transport(format!("failed to spawn {}: {}", config.command, e)))?;
    handler
        .serve(transport)
        .await
        .map_err(|e| ToolError::Transport(format!("MCP handshake with {} failed: {}", config.command, e)))
}

async fn close(session: McpSession) {
    if let Err(e) = session.cancel().await {
        log::debug!("MCP session did not shut down cleanly: {}", e);
    }
}

/// The payload a tool returned: its first text content, parsed as JSON
fn payload_from_result(tool: &str, result: &Value) -> Result<Value, ToolError> {
    let text = result["content"]
        .as_array()
        .and_then(|c| c.first())
        .and_then(|c| c["text"].as_str())
        .unwrap_or_default();

    if result["isError"].as_bool().unwrap_or(false) {
        return Err(ToolError::Execution {
            tool: tool.to_string(),
            message: text.to_string(),
        });
    }
    if text.trim().is_empty() {
        return Ok(json!({}));
    }
    Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

fn registration_from_tool(mut tool: Value) -> Result<ToolRegistration, ToolError> {
    if let Value::Object(map) = &mut tool {
        map.retain(|_, v| !v.is_null());
    }
    serde_json::from_value(tool).map_err(|e| ToolError::InvalidPayload {
        tool: "tools/list".to_string(),
        message: e.to_string(),
    })
}

/// [`ToolTransport`] backed by an MCP server started per session
pub struct McpToolTransport {
    config: McpServerConfig,
}

impl McpToolTransport {
    pub fn new(config: McpServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ToolTransport for McpToolTransport {
    async fn list_tools(&self) -> Result<Vec<ToolRegistration>, ToolError> {
        let session = connect(&self.config, ScopedClientHandler::new(vec![], None)).await?;
        let listed = session
            .list_all_tools()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()));
        close(session).await;

        let tools = listed?
            .into_iter()
            .map(|t| {
                serde_json::to_value(t).map_err(|e| ToolError::Transport(e.to_string()))
            })
            .map(|v| v.and_then(registration_from_tool))
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("Discovered {} tools from {}", tools.len(), self.config.command);
        Ok(tools)
    }

    async fn call_tool(
        &self,
        invocation: &ToolInvocation,
        scope: &CallScope,
        elicitor: Arc<dyn Elicitor>,
    ) -> Result<Value, ToolError> {
        log::info!(
            "MCP call {} for agent {} (run {}, output {})",
            invocation.tool_name,
            scope.agent_id,
            scope.run_id,
            scope.output_id
        );
        let handler = ScopedClientHandler::new(scope.roots(), Some(elicitor));
        let session = connect(&self.config, handler).await?;

        let arguments = match &invocation.tool_arguments {
            Value::Object(map) => Some(map.clone()),
            _ => None,
        };
        let outcome = session
            .call_tool(CallToolRequestParam {
                name: invocation.tool_name.clone().into(),
                arguments,
            })
            .await
            .map_err(|e| ToolError::Execution {
                tool: invocation.tool_name.clone(),
                message: e.to_string(),
            });
        close(session).await;

        let result = serde_json::to_value(outcome?).map_err(|e| ToolError::InvalidPayload {
            tool: invocation.tool_name.clone(),
            message: e.to_string(),
        })?;
        payload_from_result(&invocation.tool_name, &result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_parsed_json() {
        let result = json!({"content": [{"type": "text", "text": "{\"type\":\"markdown\",\"data\":\"8\"}"}]});
        let payload = payload_from_result("add", &result).unwrap();
        assert_eq!(payload["data"], "8");
    }

    #[test]
    fn test_plain_text_payload_kept_as_string() {
        let result = json!({"content": [{"type": "text", "text": "eight"}]});
        assert_eq!(payload_from_result("add", &result).unwrap(), json!("eight"));
    }

    #[test]
    fn test_empty_content_is_empty_object() {
        assert_eq!(payload_from_result("x", &json!({"content": []})).unwrap(), json!({}));
    }

    #[test]
    fn test_error_result() {
        let result = json!({"isError": true, "content": [{"type": "text", "text": "bad input"}]});
        assert!(matches!(
            payload_from_result("add", &result),
            Err(ToolError::Execution { .. })
        ));
    }

    #[test]
    fn test_registration_from_listing() {
        let reg = registration_from_tool(json!({
            "name": "add",
            "description": "adds",
            "title": null,
            "inputSchema": {"type": "object"},
            "annotations": null
        }))
        .unwrap();
        assert_eq!(reg.name, "add");
    }

    #[test]
    fn test_roots_follow_scope() {
        let handler = ScopedClientHandler::new(vec!["file://w".into(), "file://a".into()], None);
        let roots = serde_json::to_value(handler.roots_result().unwrap()).unwrap();
        assert_eq!(roots["roots"][0]["uri"], "file://w");
        assert_eq!(roots["roots"][1]["uri"], "file://a");
    }

    #[test]
    fn test_refuse_maps_to_decline() {
        let result = serde_json::to_value(elicitation_result(ElicitResponse::Refuse).unwrap()).unwrap();
        assert_eq!(result["action"], "decline");
    }

    #[test]
    fn test_cancel_maps_to_cancel() {
        let result = serde_json::to_value(elicitation_result(ElicitResponse::Cancel).unwrap()).unwrap();
        assert_eq!(result["action"], "cancel");
        assert!(result.get("content").map_or(true, Value::is_null));
    }

    #[test]
    fn test_accepted_text_is_wrapped() {
        let result =
            serde_json::to_value(elicitation_result(ElicitResponse::Accept(json!("yes"))).unwrap()).unwrap();
        assert_eq!(result["action"], "accept");
        assert_eq!(result["content"], json!({"response": "yes"}));
    }
}
