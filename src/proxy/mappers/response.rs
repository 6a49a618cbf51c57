use super::models::*;
use crate::proxy::signature_cache::SignatureCache;
use serde_json::{json, Value};

// Convert an upstream response into one Anthropic-format message body.
pub fn transform_response(response: &UpstreamResponse, requested_model: &str) -> Value {
    let family = super::thinking::model_family(requested_model).to_string();
    let mut content: Vec<Value> = Vec::new();
    let mut used_tool = false;
    let mut finish_reason: Option<String> = None;

    for candidate in &response.candidates {
        if let Some(reason) = &candidate.finish_reason {
            finish_reason = Some(reason.clone());
        }
        let Some(body) = &candidate.content else {
            continue;
        };
        for part in &body.parts {
            if let Some(fc) = &part.function_call {
                used_tool = true;
                if let Some(sig) = &part.thought_signature {
                    SignatureCache::global().cache_family(sig.clone(), family.clone());
                }
                content.push(json!({
                    "type": "tool_use",
                    "id": fc.id.clone().unwrap_or_else(|| format!(
                        "toolu_{}",
                        uuid::Uuid::new_v4().simple()
                    )),
                    "name": fc.name,
                    "input": fc.args,
                }));
                continue;
            }
            if let Some(text) = &part.text {
                if text.is_empty() {
                    continue;
                }
                if part.thought.unwrap_or(false) {
                    let mut block = json!({ "type": "thinking", "thinking": text });
                    if let Some(sig) = &part.thought_signature {
                        SignatureCache::global().cache_family(sig.clone(), family.clone());
                        block["signature"] = json!(sig);
                    }
                    merge_or_push_thinking(&mut content, block);
                } else {
                    merge_or_push_text(&mut content, text);
                }
                continue;
            }
            if let Some(img) = &part.inline_data {
                if !img.data.is_empty() {
                    content.push(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.mime_type,
                            "data": img.data,
                        }
                    }));
                }
            }
        }
    }

    let stop_reason = if used_tool {
        "tool_use"
    } else if finish_reason.as_deref() == Some("MAX_TOKENS") {
        "max_tokens"
    } else {
        "end_turn"
    };
    let usage = response
        .usage_metadata
        .as_ref()
        .map(to_claude_usage)
        .unwrap_or_default();

    json!({
        "id": response
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        "type": "message",
        "role": "assistant",
        "model": requested_model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage,
    })
}

fn merge_or_push_text(content: &mut Vec<Value>, text: &str) {
    if let Some(last) = content.last_mut() {
        if last["type"] == "text" {
            let merged = format!("{}{}", last["text"].as_str().unwrap_or(""), text);
            last["text"] = json!(merged);
            return;
        }
    }
    content.push(json!({ "type": "text", "text": text }));
}

fn merge_or_push_thinking(content: &mut Vec<Value>, block: Value) {
    if let Some(last) = content.last_mut() {
        if last["type"] == "thinking" && block.get("signature").is_none() {
            let merged = format!(
                "{}{}",
                last["thinking"].as_str().unwrap_or(""),
                block["thinking"].as_str().unwrap_or("")
            );
            last["thinking"] = json!(merged);
            return;
        }
        if last["type"] == "thinking" && last.get("signature").is_none() {
            let merged = format!(
                "{}{}",
                last["thinking"].as_str().unwrap_or(""),
                block["thinking"].as_str().unwrap_or("")
            );
            *last = block;
            last["thinking"] = json!(merged);
            return;
        }
    }
    content.push(block);
}

// The upstream never emits thinking text on the unary path, so non-streaming
// calls to thinking models fetch the SSE endpoint and fold the events into a
// single response here.
pub fn aggregate_sse_body(body: &str) -> Result<UpstreamResponse, String> {
    let mut merged = UpstreamResponse::default();
    let mut parts: Vec<UpstreamPart> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut saw_event = false;

    for line in body.lines() {
        let line = line.trim();
        if !line.starts_with("data:") {
            continue;
        }
        let Some(event) = super::streaming::parse_sse_data_line(line) else {
            continue;
        };
        saw_event = true;
        if merged.response_id.is_none() {
            merged.response_id = event.response_id.clone();
        }
        if merged.model_version.is_none() {
            merged.model_version = event.model_version.clone();
        }
        if let Some(usage) = event.usage_metadata {
            merged.usage_metadata = Some(usage);
        }
        for candidate in event.candidates {
            if let Some(reason) = candidate.finish_reason {
                finish_reason = Some(reason);
            }
            if let Some(content) = candidate.content {
                parts.extend(content.parts);
            }
        }
    }

    if !saw_event {
        return Err("stream contained no events".to_string());
    }

    merged.candidates = vec![UpstreamCandidate {
        content: Some(UpstreamContent { parts }),
        finish_reason,
    }];
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(json: serde_json::Value) -> UpstreamResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn plain_text_response_maps_to_single_text_block() {
        let response = upstream(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "hello " }, { "text": "world" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 2 },
            "responseId": "resp-1"
        }));
        let message = transform_response(&response, "claude-sonnet-4-5");

        assert_eq!(message["id"], "resp-1");
        assert_eq!(message["stop_reason"], "end_turn");
        assert_eq!(message["content"].as_array().unwrap().len(), 1);
        assert_eq!(message["content"][0]["text"], "hello world");
        assert_eq!(message["usage"]["input_tokens"], 10);
    }

    #[test]
    fn thinking_parts_become_thinking_block_with_signature() {
        let _guard = SignatureCache::test_guard();
        SignatureCache::global().clear();
        let sig = "t".repeat(64);
        let response = upstream(json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "step one. ", "thought": true },
                    { "text": "step two.", "thought": true, "thoughtSignature": sig },
                    { "text": "the answer" }
                ] }
            }]
        }));
        let message = transform_response(&response, "claude-opus-4-5-thinking");
        let content = message["content"].as_array().unwrap();

        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "thinking");
        assert_eq!(content[0]["thinking"], "step one. step two.");
        assert_eq!(content[0]["signature"], json!(sig));
        assert_eq!(content[1]["type"], "text");
        assert_eq!(
            SignatureCache::global().family_of(&sig),
            Some("claude".to_string())
        );
    }

    #[test]
    fn function_call_sets_tool_use_stop_reason() {
        let response = upstream(json!({
            "candidates": [{
                "content": { "parts": [
                    { "functionCall": { "name": "bash", "args": { "cmd": "ls" }, "id": "toolu_5" } }
                ] }
            }]
        }));
        let message = transform_response(&response, "gemini-3-pro-high");

        assert_eq!(message["stop_reason"], "tool_use");
        assert_eq!(message["content"][0]["type"], "tool_use");
        assert_eq!(message["content"][0]["id"], "toolu_5");
        assert_eq!(message["content"][0]["input"]["cmd"], "ls");
    }

    #[test]
    fn max_tokens_finish_reason_maps_through() {
        let response = upstream(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "partial" }] },
                "finishReason": "MAX_TOKENS"
            }]
        }));
        let message = transform_response(&response, "claude-sonnet-4-5");
        assert_eq!(message["stop_reason"], "max_tokens");
    }

    #[test]
    fn aggregate_folds_sse_events_into_one_response() {
        let body = concat!(
            "data: {\"response\":{\"responseId\":\"r1\",\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}}\n\n",
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":7,\"candidatesTokenCount\":2}}}\n\n",
        );
        let merged = aggregate_sse_body(body).expect("aggregated");

        assert_eq!(merged.response_id.as_deref(), Some("r1"));
        let candidate = &merged.candidates[0];
        assert_eq!(candidate.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(candidate.content.as_ref().unwrap().parts.len(), 2);
        assert_eq!(
            merged.usage_metadata.as_ref().unwrap().prompt_token_count,
            Some(7)
        );
    }

    #[test]
    fn aggregate_rejects_empty_stream() {
        assert!(aggregate_sse_body("").is_err());
        assert!(aggregate_sse_body(": ping\n\n").is_err());
    }

    #[test]
    fn translator_round_trip_preserves_meaning() {
        let _guard = SignatureCache::test_guard();
        // upstream -> inbound -> upstream differs only in stripped fields.
        SignatureCache::global().clear();
        let sig = "r".repeat(64);
        let response = upstream(json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "reasoning", "thought": true, "thoughtSignature": sig },
                    { "functionCall": { "name": "grep", "args": { "pattern": "x" }, "id": "toolu_7" } }
                ] }
            }]
        }));
        let message = transform_response(&response, "claude-opus-4-5-thinking");

        let request: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-opus-4-5-thinking",
            "messages": [
                { "role": "user", "content": "please run a search over the tree" },
                { "role": "assistant", "content": message["content"] }
            ]
        }))
        .unwrap();
        let body =
            super::super::request::build_upstream_request(&request, "proj", "sid-r").unwrap();
        let parts = body["request"]["contents"][1]["parts"].as_array().unwrap();

        assert_eq!(parts[0]["text"], "reasoning");
        assert_eq!(parts[0]["thought"], true);
        assert_eq!(parts[0]["thoughtSignature"], json!(sig));
        assert_eq!(parts[1]["functionCall"]["name"], "grep");
        assert!(serde_json::to_string(&body).unwrap().find("cache_control").is_none());
    }
}
