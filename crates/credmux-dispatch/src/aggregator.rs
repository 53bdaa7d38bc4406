use std::collections::{BTreeMap, HashMap};

use credmux_provider::ProviderUsage;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
struct ToolCallAccum {
    id: Option<String>,
    kind: Option<String>,
    name: String,
    arguments: String,
}

/// Folds a sequence of OpenAI-shaped chat-completion chunks into a shadow
/// response for accounting (spec.md §4.G). Never touches the bytes forwarded
/// to the client; a chunk that doesn't match the expected shape is skipped
/// rather than rejected, since accounting is best-effort.
#[derive(Debug, Default)]
pub struct Aggregator {
    content: String,
    tool_calls: BTreeMap<u64, ToolCallAccum>,
    function_call: Option<ToolCallAccum>,
    scalar_strings: HashMap<String, String>,
    scalar_last: HashMap<String, Value>,
    finish_reason: Option<String>,
    usage: Option<ProviderUsage>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold_chunk(&mut self, value: &Value) {
        if let Some(usage) = value.get("usage") {
            self.usage = Some(ProviderUsage {
                prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            });
        }

        let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
            return;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        let Some(delta) = choice.get("delta").and_then(Value::as_object) else {
            return;
        };

        for (key, value) in delta {
            match key.as_str() {
                "role" => {}
                "content" => {
                    if let Some(text) = value.as_str() {
                        self.content.push_str(text);
                    }
                }
                "tool_calls" => self.fold_tool_calls(value),
                "function_call" => self.fold_function_call(value),
                _ => {
                    if let Some(text) = value.as_str() {
                        self.scalar_strings.entry(key.clone()).or_default().push_str(text);
                    } else {
                        self.scalar_last.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    fn fold_tool_calls(&mut self, value: &Value) {
        let Some(entries) = value.as_array() else {
            return;
        };
        for entry in entries {
            let Some(index) = entry.get("index").and_then(Value::as_u64) else {
                continue;
            };
            let accum = self.tool_calls.entry(index).or_default();
            if accum.id.is_none()
                && let Some(id) = entry.get("id").and_then(Value::as_str)
                && !id.is_empty()
            {
                accum.id = Some(id.to_string());
            }
            if let Some(kind) = entry.get("type").and_then(Value::as_str) {
                accum.kind = Some(kind.to_string());
            }
            if let Some(function) = entry.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    accum.name.push_str(name);
                }
                if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                    accum.arguments.push_str(arguments);
                }
            }
        }
    }

    fn fold_function_call(&mut self, value: &Value) {
        let accum = self.function_call.get_or_insert_with(ToolCallAccum::default);
        if let Some(name) = value.get("name").and_then(Value::as_str) {
            accum.name.push_str(name);
        }
        if let Some(arguments) = value.get("arguments").and_then(Value::as_str) {
            accum.arguments.push_str(arguments);
        }
    }

    pub fn usage(&self) -> Option<ProviderUsage> {
        self.usage.clone()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Reconstructs the logical response for the accounting side channel
    /// only (spec.md §4.G "Final reconstruction is emitted only to the
    /// accounting side channel").
    pub fn shadow_response(&self) -> Value {
        let mut delta = serde_json::Map::new();
        if !self.content.is_empty() {
            delta.insert("content".to_string(), Value::String(self.content.clone()));
        }
        if !self.tool_calls.is_empty() {
            let tool_calls: Vec<Value> = self
                .tool_calls
                .iter()
                .map(|(index, accum)| {
                    serde_json::json!({
                        "index": index,
                        "id": accum.id,
                        "type": accum.kind,
                        "function": { "name": accum.name, "arguments": accum.arguments },
                    })
                })
                .collect();
            delta.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        if let Some(function_call) = &self.function_call {
            delta.insert(
                "function_call".to_string(),
                serde_json::json!({ "name": function_call.name, "arguments": function_call.arguments }),
            );
        }
        for (key, value) in &self.scalar_strings {
            delta.insert(key.clone(), Value::String(value.clone()));
        }
        for (key, value) in &self.scalar_last {
            delta.insert(key.clone(), value.clone());
        }

        serde_json::json!({
            "choices": [{ "delta": delta, "finish_reason": self.finish_reason }],
            "usage": self.usage.as_ref().map(|u| serde_json::json!({
                "prompt_tokens": u.prompt_tokens,
                "completion_tokens": u.completion_tokens,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_content_deltas_in_order() {
        let mut aggregator = Aggregator::new();
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"content": "Hel"}}]}));
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"content": "lo"}}]}));
        assert_eq!(aggregator.shadow_response()["choices"][0]["delta"]["content"], "Hello");
    }

    #[test]
    fn buckets_tool_calls_by_index_and_keeps_first_id() {
        let mut aggregator = Aggregator::new();
        aggregator.fold_chunk(&serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "get_weath", "arguments": ""}}
            ]}}]
        }));
        aggregator.fold_chunk(&serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "", "function": {"name": "er", "arguments": "{\"city\":"}}
            ]}}]
        }));
        aggregator.fold_chunk(&serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"nyc\"}"}}
            ]}}]
        }));

        let shadow = aggregator.shadow_response();
        let call = &shadow["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["function"]["name"], "get_weather");
        assert_eq!(call["function"]["arguments"], "{\"city\":\"nyc\"}");
    }

    #[test]
    fn concatenates_function_call_name_and_arguments() {
        let mut aggregator = Aggregator::new();
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"function_call": {"name": "lookup"}}}]}));
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"function_call": {"arguments": "{}"}}}]}));
        let shadow = aggregator.shadow_response();
        assert_eq!(shadow["choices"][0]["delta"]["function_call"]["name"], "lookup");
        assert_eq!(shadow["choices"][0]["delta"]["function_call"]["arguments"], "{}");
    }

    #[test]
    fn records_finish_reason_and_usage() {
        let mut aggregator = Aggregator::new();
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}));
        aggregator.fold_chunk(&serde_json::json!({"usage": {"prompt_tokens": 12, "completion_tokens": 3}}));
        assert_eq!(aggregator.finish_reason(), Some("stop"));
        let usage = aggregator.usage().unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn scalar_string_fields_concatenate_others_take_last_value() {
        let mut aggregator = Aggregator::new();
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"reasoning": "step one. "}}]}));
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"reasoning": "step two."}}]}));
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"confidence": 0.4}}]}));
        aggregator.fold_chunk(&serde_json::json!({"choices": [{"delta": {"confidence": 0.9}}]}));

        let shadow = aggregator.shadow_response();
        assert_eq!(shadow["choices"][0]["delta"]["reasoning"], "step one. step two.");
        assert_eq!(shadow["choices"][0]["delta"]["confidence"], 0.9);
    }
}
