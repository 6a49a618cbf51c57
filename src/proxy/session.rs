use crate::proxy::mappers::models::{ClaudeRequest, ContentBlock, MessageContent};
use sha2::{Digest, Sha256};

// Stable per-conversation fingerprint. Only the first substantive user
// message is hashed, so every turn of the same conversation lands on the same
// upstream prompt-cache entry. An explicit metadata.user_id wins.
pub fn extract_session_id(request: &ClaudeRequest) -> String {
    if let Some(metadata) = &request.metadata {
        if let Some(user_id) = &metadata.user_id {
            if !user_id.is_empty() && !user_id.contains("session-") {
                tracing::debug!("[Session] Using explicit user_id: {}", user_id);
                return user_id.clone();
            }
        }
    }

    let mut hasher = Sha256::new();
    let mut content_found = false;

    for msg in &request.messages {
        if msg.role != "user" {
            continue;
        }
        let text = match &msg.content {
            MessageContent::String(s) => s.clone(),
            MessageContent::Array(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        };

        let clean_text = text.trim();
        // Skip probe-sized messages and injected system labels; they vary
        // between turns and would break cache locality.
        if clean_text.len() > 10 && !clean_text.contains("<system-reminder>") {
            hasher.update(clean_text.as_bytes());
            content_found = true;
            break;
        }
    }

    if !content_found {
        if let Some(last_msg) = request.messages.last() {
            hasher.update(format!("{:?}", last_msg.content).as_bytes());
        }
    }

    let hash = format!("{:x}", hasher.finalize());
    format!("sid-{}", &hash[..16])
}
