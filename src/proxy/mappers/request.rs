use super::models::*;
use serde_json::{json, Value};
use std::collections::HashMap;

const MAX_TOOL_RESULT_CHARS: usize = 200_000;

// Upstream rejects unknown fields; cache_control must never leak through.
pub fn clean_cache_control(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if let MessageContent::Array(blocks) = &mut msg.content {
            for block in blocks.iter_mut() {
                match block {
                    ContentBlock::Text { cache_control, .. }
                    | ContentBlock::ToolUse { cache_control, .. }
                    | ContentBlock::ToolResult { cache_control, .. } => {
                        *cache_control = None;
                    }
                    _ => {}
                }
            }
        }
    }
}

// Defence-in-depth: the sanitisation is repeated on the serialized body.
pub fn deep_clean_cache_control(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("cache_control");
            for (_, child) in map.iter_mut() {
                deep_clean_cache_control(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                deep_clean_cache_control(child);
            }
        }
        _ => {}
    }
}

fn build_system_instruction(system: &Option<Value>) -> Option<Value> {
    let system = system.as_ref()?;
    let text = match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    if text.trim().is_empty() {
        return None;
    }
    Some(json!({ "role": "user", "parts": [{ "text": text }] }))
}

fn flatten_tool_result(content: &Value, is_error: bool) -> String {
    let mut merged = match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    Some(text.to_string())
                } else if block.get("type").and_then(|v| v.as_str()) == Some("image") {
                    Some("[image omitted to save context]".to_string())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    if merged.len() > MAX_TOOL_RESULT_CHARS {
        tracing::warn!(
            "[Claude-Request] Truncating tool result from {} chars to {}",
            merged.len(),
            MAX_TOOL_RESULT_CHARS
        );
        let mut truncated = merged.chars().take(MAX_TOOL_RESULT_CHARS).collect::<String>();
        truncated.push_str("\n...[truncated output]");
        merged = truncated;
    }
    if merged.trim().is_empty() {
        if is_error {
            merged = "Tool execution failed with no output.".to_string();
        } else {
            merged = "Command executed successfully.".to_string();
        }
    }
    merged
}

fn build_parts(
    content: &MessageContent,
    is_assistant: bool,
    tool_id_to_name: &mut HashMap<String, String>,
) -> Vec<Value> {
    let mut parts = Vec::new();

    match content {
        MessageContent::String(text) => {
            if !text.trim().is_empty() && text != "(no content)" {
                parts.push(json!({ "text": text.trim() }));
            }
        }
        MessageContent::Array(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => {
                        if text != "(no content)" && !text.is_empty() {
                            parts.push(json!({ "text": text }));
                        }
                    }
                    ContentBlock::Thinking {
                        thinking,
                        signature,
                    } => {
                        if thinking.is_empty() {
                            continue;
                        }
                        let mut part = json!({ "text": thinking, "thought": true });
                        if let Some(sig) = signature {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    ContentBlock::RedactedThinking { data } => {
                        parts.push(json!({
                            "text": format!("[Redacted Thinking: {}]", data)
                        }));
                    }
                    ContentBlock::Image { source } => {
                        if source.source_type == "base64" {
                            parts.push(json!({
                                "inlineData": {
                                    "mimeType": source.media_type,
                                    "data": source.data
                                }
                            }));
                        }
                    }
                    ContentBlock::ToolUse {
                        id,
                        name,
                        input,
                        signature,
                        ..
                    } => {
                        tool_id_to_name.insert(id.clone(), name.clone());
                        let mut part = json!({
                            "functionCall": {
                                "name": name,
                                "args": input,
                                "id": id
                            }
                        });
                        if is_assistant {
                            if let Some(sig) = signature {
                                part["thoughtSignature"] = json!(sig);
                            }
                        }
                        parts.push(part);
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                        ..
                    } => {
                        let func_name = tool_id_to_name
                            .get(tool_use_id)
                            .cloned()
                            .unwrap_or_else(|| tool_use_id.clone());
                        let merged = flatten_tool_result(content, is_error.unwrap_or(false));
                        parts.push(json!({
                            "functionResponse": {
                                "name": func_name,
                                "response": { "result": merged },
                                "id": tool_use_id
                            }
                        }));
                    }
                }
            }
        }
    }

    parts
}

// Upstream requires strictly alternating roles; consecutive same-role turns
// are folded into one.
fn merge_adjacent_roles(contents: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::new();
    for content in contents {
        let same_role = merged
            .last()
            .map(|prev| prev["role"] == content["role"])
            .unwrap_or(false);
        if same_role {
            let prev = merged.last_mut().unwrap();
            if let (Some(prev_parts), Some(next_parts)) = (
                prev.get_mut("parts").and_then(|p| p.as_array_mut()),
                content.get("parts").and_then(|p| p.as_array()),
            ) {
                prev_parts.extend(next_parts.clone());
            }
        } else {
            merged.push(content);
        }
    }
    merged
}

fn build_generation_config(req: &ClaudeRequest) -> Value {
    let mut config = json!({});
    if let Some(max_tokens) = req.max_tokens {
        config["maxOutputTokens"] = json!(max_tokens);
    }
    if let Some(temperature) = req.temperature {
        config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = req.top_p {
        config["topP"] = json!(top_p);
    }
    if let Some(stops) = &req.stop_sequences {
        if !stops.is_empty() {
            config["stopSequences"] = json!(stops);
        }
    }
    if super::thinking::is_thinking_model(&req.model) {
        let mut thinking_config = json!({ "includeThoughts": true });
        if let Some(cfg) = &req.thinking {
            if let Some(budget) = cfg.budget_tokens {
                thinking_config["thinkingBudget"] = json!(budget);
            }
        }
        config["thinkingConfig"] = thinking_config;
    }
    config
}

fn build_tools(tools: &Option<Vec<Tool>>) -> Option<Value> {
    let tools = tools.as_ref()?;
    if tools.is_empty() {
        return None;
    }
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut schema = tool.input_schema.clone().unwrap_or_else(|| json!({}));
            super::schema::sanitize_schema(&mut schema);
            let mut decl = json!({
                "name": tool.name,
                "parameters": schema
            });
            if let Some(description) = &tool.description {
                decl["description"] = json!(description);
            }
            decl
        })
        .collect();
    Some(json!([{ "functionDeclarations": declarations }]))
}

// Convert the inbound Anthropic request into the upstream v1internal payload.
// The caller has already run clean_cache_control, signature filtering and
// tool-loop recovery over the messages.
pub fn build_upstream_request(
    req: &ClaudeRequest,
    project_id: &str,
    session_id: &str,
) -> Result<Value, String> {
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();

    let mut contents = Vec::new();
    for msg in &req.messages {
        let is_assistant = msg.role == "assistant";
        let role = if is_assistant { "model" } else { "user" };
        let parts = build_parts(&msg.content, is_assistant, &mut tool_id_to_name);
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }
    let contents = merge_adjacent_roles(contents);
    if contents.is_empty() {
        return Err("request contains no usable content".to_string());
    }

    let mut inner = json!({
        "contents": contents,
        "sessionId": session_id,
    });
    if let Some(system) = build_system_instruction(&req.system) {
        inner["systemInstruction"] = system;
    }
    let generation_config = build_generation_config(req);
    if generation_config
        .as_object()
        .map(|o| !o.is_empty())
        .unwrap_or(false)
    {
        inner["generationConfig"] = generation_config;
    }
    if let Some(tools) = build_tools(&req.tools) {
        inner["tools"] = tools;
        inner["toolConfig"] = json!({
            "functionCallingConfig": { "mode": "VALIDATED" }
        });
    }

    let mut body = json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": req.model,
        "userAgent": "antigravity",
        "requestType": "agent",
    });
    deep_clean_cache_control(&mut body);
    Ok(body)
}
