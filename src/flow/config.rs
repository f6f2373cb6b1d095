// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Defaults, then environment variables, then the `engine:` section of a
//! workflow file (see [`crate::flow::loader`]).

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::adk::error::{FlowError, Result};
use crate::adk::model::GenerationConfig;

/// How an agent's generated text is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    PlainText,
    Json,
    Markdown,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::PlainText => "plain_text",
            OutputKind::Json => "json",
            OutputKind::Markdown => "markdown",
        }
    }
}

impl FromStr for OutputKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain_text" | "text" => Ok(OutputKind::PlainText),
            "json" => Ok(OutputKind::Json),
            "markdown" => Ok(OutputKind::Markdown),
            other => Err(FlowError::config(format!("unknown output kind '{}'", other))),
        }
    }
}

/// Text generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    pub model_name: String,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: None,
        }
    }
}

impl ModelConfig {
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of both event pipe queues
    pub pipe_capacity: usize,
    /// How long an elicitation waits for matching feedback
    pub feedback_timeout_secs: u64,
    /// Upper bound on how often one agent may be entered per run
    pub max_agent_visits: usize,
    pub output_kind_default: OutputKind,
    pub model: ModelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 1000,
            feedback_timeout_secs: 600,
            max_agent_visits: 5,
            output_kind_default: OutputKind::PlainText,
            model: ModelConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FlowError::config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Defaults overridden by `AGENTGRAPH_*` / `OPENAI_BASE_URL` variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = env_parse("AGENTGRAPH_PIPE_CAPACITY")? {
            config.pipe_capacity = n;
        }
        if let Some(n) = env_parse("AGENTGRAPH_FEEDBACK_TIMEOUT_SECS")? {
            config.feedback_timeout_secs = n;
        }
        if let Some(n) = env_parse("AGENTGRAPH_MAX_AGENT_VISITS")? {
            config.max_agent_visits = n;
        }
        if let Ok(model) = env::var("AGENTGRAPH_MODEL") {
            config.model.model_name = model;
        }
        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            config.model.base_url = Some(url);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipe_capacity == 0 {
            return Err(FlowError::config("pipe_capacity must be at least 1"));
        }
        if self.max_agent_visits == 0 {
            return Err(FlowError::config("max_agent_visits must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pipe_capacity, 1000);
        assert_eq!(config.feedback_timeout_secs, 600);
        assert_eq!(config.output_kind_default, OutputKind::PlainText);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: EngineConfig = serde_yaml::from_str("feedback_timeout_secs: 5\n").unwrap();
        assert_eq!(config.feedback_timeout_secs, 5);
        assert_eq!(config.max_agent_visits, 5);
        assert_eq!(config.model.provider, "openai");
    }

    #[test]
    fn test_output_kind_parse() {
        assert_eq!("json".parse::<OutputKind>().unwrap(), OutputKind::Json);
        assert_eq!("text".parse::<OutputKind>().unwrap(), OutputKind::PlainText);
        assert!("xml".parse::<OutputKind>().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = EngineConfig {
            pipe_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FlowError::Config(_))));
    }
}
