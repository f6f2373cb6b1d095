// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::adk::tool::{ElicitResponse, Elicitor};
use crate::flow::pipe::{EventPipe, FeedbackStatus};

/// Elicitation callback for one agent invocation.
///
/// Forwards the tool's request to the caller as a raw control event tagged
/// with `(workflow_id, agent_id)`, then waits for feedback with that key.
pub struct PipeElicitor {
    pipe: Arc<EventPipe>,
    workflow_id: String,
    agent_id: String,
    timeout: Duration,
}

impl PipeElicitor {
    pub fn new(
        pipe: Arc<EventPipe>,
        workflow_id: impl Into<String>,
        agent_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            pipe,
            workflow_id: workflow_id.into(),
            agent_id: agent_id.into(),
            timeout,
        }
    }

    /// The event the caller sees for `message`
    fn request_body(&self, message: &str) -> Value {
        match serde_json::from_str::<Value>(message) {
            Ok(Value::Object(mut query)) => {
                query.insert("workflow_id".to_string(), json!(self.workflow_id));
                query.insert("agent_id".to_string(), json!(self.agent_id));
                Value::Object(query)
            }
            _ => json!({
                "channel": "control",
                "command": "elicit",
                "data": message,
                "workflow_id": self.workflow_id,
                "agent_id": self.agent_id,
            }),
        }
    }

    async fn abort(&self) -> ElicitResponse {
        if let Err(e) = self.pipe.abort().await {
            log::debug!("Abort after elicitation: {}", e);
        }
        ElicitResponse::Cancel
    }
}

#[async_trait]
impl Elicitor for PipeElicitor {
    async fn elicit(&self, message: String) -> ElicitResponse {
        let body = self.request_body(&message);
        if body.get("command").and_then(Value::as_str) == Some("end") {
            log::info!("Agent {} asked to end the run", self.agent_id);
            return self.abort().await;
        }

        let reply = self.pipe.feedback().wait(&self.workflow_id, &self.agent_id).await;
        if let Err(e) = self.pipe.raw(body.to_string()).await {
            log::warn!("Elicitation for {} not sent: {}", self.agent_id, e);
            return ElicitResponse::Cancel;
        }
        log::info!("Agent {} waiting for feedback", self.agent_id);

        let cancel = self.pipe.cancel_token();
        let feedback = tokio::select! {
            _ = cancel.cancelled() => return ElicitResponse::Cancel,
            r = tokio::time::timeout(self.timeout, reply) => r,
        };

        match feedback {
            Ok(Ok(msg)) => {
                log::info!("Feedback for {}: {:?}", self.agent_id, msg.status);
                match msg.status {
                    FeedbackStatus::Accept => ElicitResponse::Accept(msg.data),
                    FeedbackStatus::Cancel => ElicitResponse::Cancel,
                    FeedbackStatus::Refuse => ElicitResponse::Refuse,
                    FeedbackStatus::End => self.abort().await,
                }
            }
            Ok(Err(_)) => ElicitResponse::Cancel,
            Err(_) => {
                log::warn!(
                    "No feedback for {} within {}s",
                    self.agent_id,
                    self.timeout.as_secs()
                );
                ElicitResponse::Cancel
            }
        }
    }
}
