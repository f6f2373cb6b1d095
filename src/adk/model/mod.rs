// SPDX-License-Identifier: MIT

//! Model module - text generation collaborator
//!
//! The engine only needs "prompt in, text out". Tool use is negotiated in
//! the prompt itself (a rendered capability catalogue), so the trait carries
//! no function-calling surface.
//! - [openai] - OpenAI-compatible chat completions

pub mod openai;

use crate::adk::error::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Configuration for model generation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

/// Parts of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Part {
    /// Regular text output from the model
    Text(String),
    /// Reasoning content some providers return alongside the answer
    Thinking(String),
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text parts, thinking excluded
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::Thinking(_) => None,
            })
            .collect()
    }
}

/// Core trait for LLM model implementations
#[async_trait]
pub trait Model: Send + Sync {
    async fn generate_content(
        &self,
        history: &[Content],
        config: Option<&GenerationConfig>,
    ) -> Result<Content, ModelError>;
}
