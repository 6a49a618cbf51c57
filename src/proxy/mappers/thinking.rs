use super::models::{ContentBlock, Message, MessageContent};
use crate::proxy::signature_cache::SignatureCache;
use tracing::{debug, info, warn};

pub const MIN_SIGNATURE_LENGTH: usize = 50;
// Substituted on Gemini targets where history demands a signature slot but no
// compatible signature survived validation.
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

pub fn model_family(model: &str) -> &'static str {
    let lowered = model.to_ascii_lowercase();
    if lowered.contains("claude") {
        "claude"
    } else if lowered.contains("gemini") {
        "gemini"
    } else {
        "unknown"
    }
}

fn gemini_major_version(model: &str) -> Option<u32> {
    // "gemini-3-pro-high" -> 3, "gemini-2.5-flash" -> 2
    let rest = model.to_ascii_lowercase();
    let rest = rest.split("gemini-").nth(1)?.to_string();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub fn is_thinking_model(model: &str) -> bool {
    let lowered = model.to_ascii_lowercase();
    match model_family(model) {
        "claude" => lowered.contains("thinking"),
        "gemini" => {
            lowered.contains("thinking") || gemini_major_version(&lowered).unwrap_or(0) >= 3
        }
        _ => false,
    }
}

// Validate every signature in history against the target family. Signatures
// from another family are always dropped. Unknown signatures are stripped for
// Gemini targets (the validator there rejects foreign material) but tolerated
// for Claude targets, which validate their own.
pub fn filter_signatures_for_family(messages: &mut [Message], target_family: &str) {
    let mut stripped = 0;
    let mut conversation_has_gemini_history = false;

    for msg in messages.iter() {
        if msg.role != "assistant" {
            continue;
        }
        if let MessageContent::Array(blocks) = &msg.content {
            for block in blocks {
                if let ContentBlock::Thinking {
                    signature: Some(sig),
                    ..
                } = block
                {
                    if SignatureCache::global().family_of(sig).as_deref() == Some("gemini") {
                        conversation_has_gemini_history = true;
                    }
                }
            }
        }
    }

    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let MessageContent::Array(blocks) = &mut msg.content else {
            continue;
        };

        for block in blocks.iter_mut() {
            let signature = match block {
                ContentBlock::Thinking { signature, .. } => signature,
                ContentBlock::ToolUse { signature, .. } => signature,
                _ => continue,
            };
            let Some(sig) = signature.clone() else {
                continue;
            };

            if sig.len() < MIN_SIGNATURE_LENGTH {
                *signature = None;
                stripped += 1;
                continue;
            }

            match SignatureCache::global().family_of(&sig) {
                Some(origin) if origin == target_family => {}
                Some(origin) => {
                    warn!(
                        "[Thinking-Sanitizer] Dropping signature from family '{}' for target '{}'",
                        origin, target_family
                    );
                    *signature = None;
                    stripped += 1;
                }
                None => {
                    if target_family == "gemini" {
                        // Strict removal for Gemini targets; keep validation
                        // quiet when the conversation is already Gemini.
                        *signature = if conversation_has_gemini_history {
                            Some(SKIP_SIGNATURE_SENTINEL.to_string())
                        } else {
                            None
                        };
                        stripped += 1;
                    } else {
                        debug!(
                            "[Thinking-Sanitizer] Unknown signature kept for claude target (len: {})",
                            sig.len()
                        );
                    }
                }
            }
        }
    }

    if stripped > 0 {
        info!(
            "[Thinking-Sanitizer] Stripped {} incompatible or unverified signatures",
            stripped
        );
    }
}

fn last_assistant_tool_use_ids(messages: &[Message]) -> Vec<String> {
    for msg in messages.iter().rev() {
        if msg.role != "assistant" {
            continue;
        }
        if let MessageContent::Array(blocks) = &msg.content {
            return blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect();
        }
        return Vec::new();
    }
    Vec::new()
}

fn resolved_tool_result_ids(messages: &[Message]) -> std::collections::HashSet<String> {
    let mut ids = std::collections::HashSet::new();
    for msg in messages {
        if let MessageContent::Array(blocks) = &msg.content {
            for block in blocks {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    ids.insert(tool_use_id.clone());
                }
            }
        }
    }
    ids
}

// Clients that switch models mid-loop can leave the history ending in a tool
// invocation that was never answered. Inject a synthetic closure so the
// upstream receives a well-formed conversation.
pub fn close_tool_loop(messages: &mut Vec<Message>) {
    let pending = last_assistant_tool_use_ids(messages);
    if pending.is_empty() {
        return;
    }
    let resolved = resolved_tool_result_ids(messages);
    let unresolved: Vec<String> = pending
        .into_iter()
        .filter(|id| !resolved.contains(id))
        .collect();
    if unresolved.is_empty() {
        return;
    }

    info!(
        "[Tool-Recovery] Closing {} interrupted tool call(s)",
        unresolved.len()
    );
    let blocks: Vec<ContentBlock> = unresolved
        .into_iter()
        .map(|id| ContentBlock::ToolResult {
            tool_use_id: id,
            content: serde_json::json!("Tool execution interrupted. No result provided."),
            is_error: Some(false),
            cache_control: None,
        })
        .collect();
    messages.push(Message {
        role: "user".to_string(),
        content: MessageContent::Array(blocks),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_detection_by_substring() {
        assert_eq!(model_family("claude-opus-4-5-thinking"), "claude");
        assert_eq!(model_family("gemini-3-pro-high"), "gemini");
        assert_eq!(model_family("mystery-model"), "unknown");
    }

    #[test]
    fn thinking_capability_rules() {
        assert!(is_thinking_model("claude-opus-4-5-thinking"));
        assert!(!is_thinking_model("claude-sonnet-4-5"));
        assert!(is_thinking_model("gemini-2.0-flash-thinking"));
        assert!(is_thinking_model("gemini-3-pro-high"));
        assert!(!is_thinking_model("gemini-2.5-flash"));
    }

    fn assistant_with_signature(sig: &str) -> Vec<Message> {
        serde_json::from_value(serde_json::json!([
            {
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "hmm", "signature": sig }
                ]
            }
        ]))
        .unwrap()
    }

    fn first_signature(messages: &[Message]) -> Option<String> {
        if let MessageContent::Array(blocks) = &messages[0].content {
            if let ContentBlock::Thinking { signature, .. } = &blocks[0] {
                return signature.clone();
            }
        }
        None
    }

    #[test]
    fn cross_family_signature_is_dropped() {
        let _guard = SignatureCache::test_guard();
        SignatureCache::global().clear();
        let sig = "g".repeat(64);
        SignatureCache::global().cache_family(sig.clone(), "gemini".to_string());

        let mut messages = assistant_with_signature(&sig);
        filter_signatures_for_family(&mut messages, "claude");
        assert_eq!(first_signature(&messages), None);
    }

    #[test]
    fn same_family_signature_survives() {
        let _guard = SignatureCache::test_guard();
        SignatureCache::global().clear();
        let sig = "c".repeat(64);
        SignatureCache::global().cache_family(sig.clone(), "claude".to_string());

        let mut messages = assistant_with_signature(&sig);
        filter_signatures_for_family(&mut messages, "claude");
        assert_eq!(first_signature(&messages), Some(sig));
    }

    #[test]
    fn unknown_signature_tolerated_for_claude_target() {
        let _guard = SignatureCache::test_guard();
        SignatureCache::global().clear();
        let sig = "u".repeat(64);
        let mut messages = assistant_with_signature(&sig);
        filter_signatures_for_family(&mut messages, "claude");
        assert_eq!(first_signature(&messages), Some(sig));
    }

    #[test]
    fn unknown_signature_stripped_for_gemini_target() {
        let _guard = SignatureCache::test_guard();
        SignatureCache::global().clear();
        let sig = "u".repeat(64);
        let mut messages = assistant_with_signature(&sig);
        filter_signatures_for_family(&mut messages, "gemini");
        assert_eq!(first_signature(&messages), None);
    }

    #[test]
    fn gemini_history_substitutes_skip_sentinel() {
        let _guard = SignatureCache::test_guard();
        SignatureCache::global().clear();
        let known = "k".repeat(64);
        SignatureCache::global().cache_family(known.clone(), "gemini".to_string());
        let unknown = "u".repeat(64);

        let mut messages: Vec<Message> = serde_json::from_value(serde_json::json!([
            {
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "a", "signature": known }
                ]
            },
            {
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "b", "signature": unknown }
                ]
            }
        ]))
        .unwrap();
        filter_signatures_for_family(&mut messages, "gemini");

        if let MessageContent::Array(blocks) = &messages[1].content {
            if let ContentBlock::Thinking { signature, .. } = &blocks[0] {
                assert_eq!(signature.as_deref(), Some(SKIP_SIGNATURE_SENTINEL));
                return;
            }
        }
        panic!("thinking block missing");
    }

    #[test]
    fn close_tool_loop_injects_synthetic_result() {
        let mut messages: Vec<Message> = serde_json::from_value(serde_json::json!([
            { "role": "user", "content": "run the tool" },
            {
                "role": "assistant",
                "content": [
                    { "type": "tool_use", "id": "toolu_01", "name": "bash", "input": {} }
                ]
            }
        ]))
        .unwrap();
        close_tool_loop(&mut messages);

        assert_eq!(messages.len(), 3);
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        if let MessageContent::Array(blocks) = &last.content {
            assert!(matches!(
                &blocks[0],
                ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_01"
            ));
        } else {
            panic!("expected array content");
        }
    }

    #[test]
    fn close_tool_loop_leaves_answered_calls_alone() {
        let mut messages: Vec<Message> = serde_json::from_value(serde_json::json!([
            { "role": "user", "content": "run the tool" },
            {
                "role": "assistant",
                "content": [
                    { "type": "tool_use", "id": "toolu_01", "name": "bash", "input": {} }
                ]
            },
            {
                "role": "user",
                "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_01", "content": "ok" }
                ]
            }
        ]))
        .unwrap();
        let before = messages.len();
        close_tool_loop(&mut messages);
        assert_eq!(messages.len(), before);
    }
}
