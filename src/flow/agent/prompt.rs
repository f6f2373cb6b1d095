// SPDX-License-Identifier: MIT

//! Prompt assembly and answer parsing

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::adk::error::{FlowError, Result};
use crate::adk::tool::{ToolInvocation, ToolRegistration};

/// Substituted for a `{{name}}` whose output does not exist yet
pub const MISSING_VALUE: &str = "(none)";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{(.*?)\}\}").unwrap_or_else(|e| panic!("placeholder pattern: {}", e))
});

static JSON_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:json)?\s*(.*?)\s*```$").unwrap_or_else(|e| panic!("fence pattern: {}", e))
});

const TOOL_INSTRUCTIONS: &str = r#"
Answer with a JSON list of tool calls, one entry per call, in the order they should run.
Prefer quoted strings from the task as argument values. Example:

Available tools:
    name: add
    description: add two numbers
    inputSchema: {"properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}, "required": ["a", "b"], "type": "object"}

Task:
    What is 3 plus 5?

JSON:
```json
[
    {"tool_name": "add", "tool_arguments": {"a": 3, "b": 5}}
]
```
"#;

/// Names referenced as `{{name}}`, in order of appearance
pub fn placeholders(task: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(task)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

/// The task followed by the resolved value of each placeholder
pub fn materialize_task(task: &str, resolved: &[(String, Option<String>)]) -> String {
    let mut lines = vec![task.trim().to_string()];
    for (name, value) in resolved {
        lines.push(format!("{{{}}} result:", name));
        lines.push(value.clone().unwrap_or_else(|| MISSING_VALUE.to_string()));
        lines.push(String::new());
    }
    lines.join("\n")
}

pub fn reference_block(inputs: &[String]) -> String {
    inputs
        .iter()
        .enumerate()
        .map(|(i, content)| format!("## Reference {}\n{}\n", i, content))
        .collect()
}

pub fn tool_catalogue(tools: &[ToolRegistration]) -> String {
    tools
        .iter()
        .map(|t| {
            format!(
                "\nname: {}\ndescription: {}\ninputSchema: {}\n",
                t.name, t.description, t.input_schema
            )
        })
        .collect()
}

pub fn compose(reference: &str, catalogue: &str, task: &str, with_tools: bool) -> String {
    format!(
        "\n# Reference\n{}\n\n# Available tools\n{}\n\n# Task\n{}\n{}\n",
        reference,
        catalogue,
        task,
        if with_tools { TOOL_INSTRUCTIONS } else { "" }
    )
}

/// Drop a surrounding Markdown code fence
pub fn strip_json_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match JSON_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => trimmed,
    }
}

/// Structured value from model text, if it is JSON at all
pub fn parse_structured(text: &str) -> Option<Value> {
    serde_json::from_str(strip_json_fence(text)).ok()
}

/// A task authored directly as a call description (object or list)
pub fn preauthored(task: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(task.trim()) {
        Ok(v @ (Value::Object(_) | Value::Array(_))) => Some(v),
        _ => None,
    }
}

/// Accepts one call object or a list of them
pub fn parse_tool_calls(value: Value) -> Result<Vec<ToolInvocation>> {
    let invalid = |e: serde_json::Error| FlowError::InvalidToolCalls(e.to_string());
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(invalid))
            .collect(),
        obj @ Value::Object(_) => Ok(vec![serde_json::from_value(obj).map_err(invalid)?]),
        other => Err(FlowError::InvalidToolCalls(format!(
            "expected a call object or list, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholders_in_order() {
        assert_eq!(
            placeholders("merge {{outline}} with {{ facts }}"),
            vec!["outline", "facts"]
        );
        assert!(placeholders("no refs").is_empty());
    }

    #[test]
    fn test_materialize_degrades_missing() {
        let task = materialize_task(
            " write it {{outline}} ",
            &[("outline".to_string(), None)],
        );
        assert_eq!(task, "write it {{outline}}\n{outline} result:\n(none)\n");
    }

    #[test]
    fn test_reference_block_numbering() {
        let block = reference_block(&["first".to_string(), "second".to_string()]);
        assert_eq!(block, "## Reference 0\nfirst\n## Reference 1\nsecond\n");
    }

    #[test]
    fn test_compose_only_instructs_with_tools() {
        assert!(!compose("", "", "t", false).contains("tool_name"));
        assert!(compose("", "", "t", true).contains("tool_name"));
    }

    #[test]
    fn test_strip_fence() {
        assert_eq!(strip_json_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_json_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_preauthored_needs_structure() {
        assert!(preauthored(r#"{"tool_name":"add"}"#).is_some());
        assert!(preauthored("3").is_none());
        assert!(preauthored("3加5是多少").is_none());
    }

    #[test]
    fn test_parse_tool_calls_shapes() {
        let calls = parse_tool_calls(json!([
            {"tool_name": "add", "tool_arguments": {"a": 3, "b": 5}}
        ]))
        .unwrap();
        assert_eq!(calls[0].tool_name, "add");
        assert_eq!(calls[0].tool_arguments["b"], 5);

        let single = parse_tool_calls(json!({"tool_name": "ping"})).unwrap();
        assert_eq!(single.len(), 1);

        assert!(matches!(
            parse_tool_calls(json!("add")),
            Err(FlowError::InvalidToolCalls(_))
        ));
        assert!(parse_tool_calls(json!([{"name": "x"}])).is_err());
    }
}
