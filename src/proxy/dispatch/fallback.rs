// Static one-step substitution into the other model family, used when every
// account for the primary is exhausted beyond the wait threshold or the
// attempt budget is gone. The recursive dispatch runs with fallback disabled,
// so chains cannot form.
pub fn fallback_model(model: &str) -> Option<&'static str> {
    match model {
        "claude-opus-4-5-thinking" => Some("gemini-3-pro-high"),
        "claude-sonnet-4-5-thinking" => Some("gemini-3-pro-low"),
        "claude-sonnet-4-5" => Some("gemini-3-flash"),
        "gemini-3-pro-high" => Some("claude-opus-4-5-thinking"),
        "gemini-3-pro-low" => Some("claude-sonnet-4-5-thinking"),
        "gemini-3-flash" => Some("claude-sonnet-4-5"),
        "gemini-2.5-flash-thinking" => Some("claude-sonnet-4-5-thinking"),
        "gemini-2.5-flash" => Some("claude-sonnet-4-5"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::thinking::{is_thinking_model, model_family};

    #[test]
    fn fallback_crosses_families() {
        for model in [
            "claude-opus-4-5-thinking",
            "claude-sonnet-4-5",
            "gemini-3-pro-high",
            "gemini-2.5-flash",
        ] {
            let fb = fallback_model(model).expect("mapped");
            assert_ne!(model_family(model), model_family(fb));
        }
    }

    #[test]
    fn thinking_models_fall_back_to_thinking_models() {
        let fb = fallback_model("claude-opus-4-5-thinking").unwrap();
        assert!(is_thinking_model(fb));
        let fb = fallback_model("gemini-3-pro-high").unwrap();
        assert!(is_thinking_model(fb));
    }

    #[test]
    fn unmapped_model_has_no_fallback() {
        assert_eq!(fallback_model("some-unknown-model"), None);
    }
}
