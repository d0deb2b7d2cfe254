//! Chat prompt flattening for single-prompt backends.

use super::ChatMessage;

/// Build a Llama-3 style prompt: optional system header, history by role,
/// the current user turn, and an open assistant header.
///
/// ```text
/// <|begin_of_text|><|start_header_id|>system<|end_header_id|>
///
/// {system}<|eot_id|><|start_header_id|>user<|end_header_id|>
///
/// {prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>
/// ```
pub fn llama3(system_prompt: Option<&str>, messages: &[ChatMessage], user_prompt: &str) -> String {
    let mut parts = vec!["<|begin_of_text|>".to_string()];

    if let Some(system) = system_prompt {
        parts.push(format!(
            "<|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>"
        ));
    }

    for message in messages {
        parts.push(format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            message.role.as_str(),
            message.content
        ));
    }

    parts.push(format!(
        "<|start_header_id|>user<|end_header_id|>\n\n{user_prompt}<|eot_id|>"
    ));
    parts.push("<|start_header_id|>assistant<|end_header_id|>\n\n".to_string());

    parts.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ChatRole;

    #[test]
    fn builds_all_sections_in_order() {
        let messages = vec![
            ChatMessage::new(ChatRole::System, "You are helpful."),
            ChatMessage::new(ChatRole::Assistant, "Hi, how can I help?"),
            ChatMessage::new(ChatRole::User, "Tell me a joke."),
        ];

        let prompt = llama3(Some("System override"), &messages, "A user prompt");

        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.contains("system<|end_header_id|>\n\nSystem override"));
        assert!(prompt.contains("You are helpful."));
        assert!(prompt.contains("assistant<|end_header_id|>\n\nHi, how can I help?"));
        assert!(prompt.contains("user<|end_header_id|>\n\nA user prompt"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));

        let system_pos = prompt.find("System override").unwrap();
        let history_pos = prompt.find("You are helpful.").unwrap();
        let user_pos = prompt.find("A user prompt").unwrap();
        assert!(system_pos < history_pos && history_pos < user_pos);
    }

    #[test]
    fn omits_system_header_when_absent() {
        let prompt = llama3(None, &[], "hi");
        assert!(!prompt.contains("system<|end_header_id|>"));
        assert!(prompt.contains("user<|end_header_id|>\n\nhi"));
    }
}
