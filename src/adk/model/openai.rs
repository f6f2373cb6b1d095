// SPDX-License-Identifier: MIT

//! OpenAI Model - chat completions API (and compatible endpoints)

use super::{Content, GenerationConfig, Model, Part};
use crate::adk::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;

/// OpenAI-compatible chat model
pub struct OpenAIModel {
    client: Client,
    api_key: String,
    model_name: String,
    base_url: String,
}

impl OpenAIModel {
    /// Create a new OpenAIModel
    ///
    /// Requires `OPENAI_API_KEY` environment variable to be set.
    /// `base_url` falls back to `OPENAI_BASE_URL`, then the public endpoint.
    pub fn new(model_name: String, base_url: Option<String>) -> Result<Self, ModelError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| ModelError::ApiKeyMissing("openai".into()))?;
        let base_url = base_url
            .or_else(|| env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: Client::new(),
            api_key,
            model_name,
            base_url,
        })
    }

    fn content_to_openai_message(content: &Content) -> Value {
        let role = match content.role.as_str() {
            "model" => "assistant",
            other => other,
        };
        json!({
            "role": role,
            "content": content.text()
        })
    }

    /// Chat completions payload; unset sampling knobs are left to the server
    fn request_body(&self, history: &[Content], config: Option<&GenerationConfig>) -> Value {
        let mut body = json!({
            "model": self.model_name,
            "messages": history.iter().map(Self::content_to_openai_message).collect::<Vec<_>>(),
        });
        let Some(cfg) = config else {
            return body;
        };
        let knobs = [
            ("temperature", cfg.temperature.map(|t| json!(t))),
            ("max_tokens", cfg.max_output_tokens.map(|n| json!(n))),
            ("top_p", cfg.top_p.map(|p| json!(p))),
        ];
        for (key, value) in knobs {
            if let Some(value) = value {
                body[key] = value;
            }
        }
        body
    }

    fn parse_openai_response(response: &Value) -> Result<Content, ModelError> {
        let message = response["choices"]
            .as_array()
            .and_then(|c| c.first())
            .map(|choice| &choice["message"])
            .ok_or_else(|| ModelError::InvalidResponse("no choices in response".into()))?;

        let mut parts = Vec::new();
        if let Some(reasoning) = message["reasoning_content"].as_str() {
            if !reasoning.is_empty() {
                parts.push(Part::Thinking(reasoning.to_string()));
            }
        }
        if let Some(text) = message["content"].as_str() {
            parts.push(Part::Text(text.to_string()));
        }

        Ok(Content {
            role: "model".to_string(),
            parts,
        })
    }
}

#[async_trait]
impl Model for OpenAIModel {
    async fn generate_content(
        &self,
        history: &[Content],
        config: Option<&GenerationConfig>,
    ) -> Result<Content, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(history, config);

        log::debug!("OpenAI request to {} with {} messages", url, history.len());

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let message = resp.text().await?;
            return Err(ModelError::Api {
                provider: "openai".to_string(),
                message,
            });
        }

        let resp_json: Value = resp.json().await?;
        Self::parse_openai_response(&resp_json)
    }
}
