use super::models::*;
use crate::proxy::signature_cache::SignatureCache;
use bytes::Bytes;
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;

pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    Function,
}

// Re-emits upstream parts as Anthropic SSE events, tracking the open content
// block so the event sequence stays well-formed.
pub struct StreamingState {
    block_type: BlockType,
    pub block_index: usize,
    pub message_start_sent: bool,
    pub message_stop_sent: bool,
    used_tool: bool,
    pending_signature: Option<String>,
    pub model_name: Option<String>,
    pub has_thinking: bool,
    pub has_content: bool,
    last_usage: Option<UsageMetadata>,
    finish_reason: Option<String>,
}

impl StreamingState {
    pub fn new(model: &str) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            pending_signature: None,
            model_name: Some(model.to_string()),
            has_thinking: false,
            has_content: false,
            last_usage: None,
            finish_reason: None,
        }
    }

    pub fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    pub fn emit_message_start(&mut self, response: &UpstreamResponse) -> Bytes {
        if self.message_start_sent {
            return Bytes::new();
        }
        let usage = response
            .usage_metadata
            .as_ref()
            .map(to_claude_usage)
            .unwrap_or_default();
        let message = json!({
            "id": response
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": self.model_name.clone().unwrap_or_default(),
            "stop_reason": null,
            "stop_sequence": null,
            "usage": usage,
        });
        self.message_start_sent = true;
        self.emit(
            "message_start",
            json!({ "type": "message_start", "message": message }),
        )
    }

    pub fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block_type != BlockType::None {
            chunks.extend(self.end_block());
        }
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block_type = block_type;
        chunks
    }

    pub fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }
        let mut chunks = Vec::new();
        if self.block_type == BlockType::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                chunks.push(self.emit_delta("signature_delta", json!({ "signature": signature })));
            }
        }
        chunks.push(self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block_index += 1;
        self.block_type = BlockType::None;
        chunks
    }

    pub fn emit_delta(&self, delta_type: &str, delta_content: Value) -> Bytes {
        let mut delta = json!({ "type": delta_type });
        if let Value::Object(map) = delta_content {
            for (k, v) in map {
                delta[k] = v;
            }
        }
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    pub fn emit_finish(&mut self) -> Vec<Bytes> {
        let mut chunks = self.end_block();

        let stop_reason = if self.used_tool {
            "tool_use"
        } else if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };
        let usage = self
            .last_usage
            .as_ref()
            .map(to_claude_usage)
            .unwrap_or_default();

        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": usage
            }),
        ));
        if !self.message_stop_sent {
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
            self.message_stop_sent = true;
        }
        chunks
    }

    pub fn current_block_type(&self) -> BlockType {
        self.block_type
    }

    fn family(&self) -> String {
        self.model_name
            .as_deref()
            .map(super::thinking::model_family)
            .unwrap_or("unknown")
            .to_string()
    }

    fn note_signature(&mut self, signature: String) {
        SignatureCache::global().cache_family(signature.clone(), self.family());
        self.pending_signature = Some(signature);
    }

    // Feed one upstream part through the state machine.
    pub fn process_part(&mut self, part: &UpstreamPart) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        if let Some(fc) = &part.function_call {
            let id = fc
                .id
                .clone()
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            if let Some(sig) = &part.thought_signature {
                SignatureCache::global().cache_family(sig.clone(), self.family());
            }
            chunks.extend(self.start_block(
                BlockType::Function,
                json!({ "type": "tool_use", "id": id, "name": fc.name, "input": {} }),
            ));
            let args = serde_json::to_string(&fc.args).unwrap_or_else(|_| "{}".to_string());
            chunks.push(self.emit_delta("input_json_delta", json!({ "partial_json": args })));
            chunks.extend(self.end_block());
            self.used_tool = true;
            self.has_content = true;
            return chunks;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                if self.block_type != BlockType::Thinking {
                    chunks.extend(self.start_block(
                        BlockType::Thinking,
                        json!({ "type": "thinking", "thinking": "" }),
                    ));
                }
                self.has_thinking = true;
                if !text.is_empty() {
                    chunks.push(self.emit_delta("thinking_delta", json!({ "thinking": text })));
                }
                if let Some(sig) = &part.thought_signature {
                    self.note_signature(sig.clone());
                }
            } else if !text.is_empty() {
                if self.block_type != BlockType::Text {
                    chunks.extend(
                        self.start_block(BlockType::Text, json!({ "type": "text", "text": "" })),
                    );
                }
                self.has_content = true;
                chunks.push(self.emit_delta("text_delta", json!({ "text": text })));
            }
        }

        if let Some(img) = &part.inline_data {
            if !img.data.is_empty() {
                let markdown = format!("![image](data:{};base64,{})", img.mime_type, img.data);
                if self.block_type != BlockType::Text {
                    chunks.extend(
                        self.start_block(BlockType::Text, json!({ "type": "text", "text": "" })),
                    );
                }
                self.has_content = true;
                chunks.push(self.emit_delta("text_delta", json!({ "text": markdown })));
            }
        }

        chunks
    }

    pub fn process_response(&mut self, response: &UpstreamResponse) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if !self.message_start_sent {
            let start = self.emit_message_start(response);
            if !start.is_empty() {
                chunks.push(start);
            }
        }
        if let Some(usage) = &response.usage_metadata {
            self.last_usage = Some(usage.clone());
        }
        for candidate in &response.candidates {
            if let Some(reason) = &candidate.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    chunks.extend(self.process_part(part));
                }
            }
        }
        chunks
    }
}

pub fn parse_sse_data_line(line: &str) -> Option<UpstreamResponse> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<UpstreamEnvelope>(data) {
        Ok(envelope) => Some(envelope.into_response()),
        Err(e) => {
            tracing::warn!("[Claude-SSE] Failed to parse upstream event: {}", e);
            None
        }
    }
}

// Translate a raw upstream SSE byte stream into Anthropic-format events.
pub fn create_claude_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    model: String,
    trace_id: String,
) -> SseStream {
    use async_stream::stream;
    use bytes::BytesMut;
    use futures::StreamExt;

    Box::pin(stream! {
        let mut state = StreamingState::new(&model);
        let mut buffer = BytesMut::new();

        loop {
            let next_chunk = tokio::time::timeout(
                std::time::Duration::from_secs(60),
                upstream.next(),
            )
            .await;

            match next_chunk {
                Ok(Some(Ok(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line_str) = std::str::from_utf8(&line_raw) else {
                            continue;
                        };
                        let line = line_str.trim();
                        if line.is_empty() || line.starts_with(':') {
                            continue;
                        }
                        if let Some(response) = parse_sse_data_line(line) {
                            for sse_chunk in state.process_response(&response) {
                                yield Ok(sse_chunk);
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("[{}] Upstream stream error: {}", trace_id, e);
                    yield Err(format!("Stream error: {}", e));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    // Keep the client connection alive while upstream stalls.
                    yield Ok(Bytes::from(": ping\n\n"));
                }
            }
        }

        if state.message_start_sent {
            for chunk in state.emit_finish() {
                yield Ok(chunk);
            }
        }
    })
}

// A well-formed terminal stream for the empty-response case, so the client
// parser sees message_stop instead of a hang.
pub fn synthetic_no_response_stream(model: &str) -> Vec<Bytes> {
    let mut state = StreamingState::new(model);
    let mut chunks = Vec::new();
    chunks.push(state.emit_message_start(&UpstreamResponse::default()));
    chunks.extend(state.start_block(BlockType::Text, json!({ "type": "text", "text": "" })));
    chunks.push(state.emit_delta(
        "text_delta",
        json!({ "text": "[No response after retries - please try again]" }),
    ));
    chunks.extend(state.emit_finish());
    chunks
}
