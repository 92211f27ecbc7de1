//! Chat template application.

/// Render a serialized chat history into a single prompt string.
///
/// Currently a pass-through: the payload is tokenized as-is.
// TODO: parse the chat-history JSON and render it through the model's Jinja
// chat template once a template engine is wired in.
pub fn apply_chat_template(payload: &str) -> String {
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through() {
        let payload = r#"[{"role":"user","content":"hi"}]"#;
        assert_eq!(apply_chat_template(payload), payload);
    }
}
