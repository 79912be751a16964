use crate::llm::types::{Conversation, Message};

/// Estimate token count for a text string using a 4 chars/token heuristic.
///
/// Fast, dependency-free approximation; no external tokenizer needed.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

/// Estimate token count for a single message, including tool-call payloads.
///
/// Adds a small overhead per message for role/structure tokens.
pub(crate) fn estimate_message_tokens(message: &Message) -> u32 {
    const MESSAGE_OVERHEAD: u32 = 4; // role, separators

    let content_tokens = message
        .content
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);
    let call_tokens: u32 = message
        .tool_calls
        .iter()
        .map(|call| {
            estimate_tokens(&call.id) + estimate_tokens(&call.name) + estimate_tokens(&call.arguments)
        })
        .sum();
    let correlation_tokens = message
        .tool_call_id
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);

    MESSAGE_OVERHEAD + content_tokens + call_tokens + correlation_tokens
}

/// Estimate the context size of a whole conversation.
pub(crate) fn estimate_conversation_tokens(conversation: &Conversation) -> u32 {
    conversation
        .messages()
        .iter()
        .map(estimate_message_tokens)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolCall;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello"), 2); // ceil(5/4)
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn message_estimate_includes_overhead() {
        // "hello world" = 11 chars → 3 tokens + 4 overhead
        assert_eq!(estimate_message_tokens(&Message::user("hello world")), 7);
    }

    #[test]
    fn tool_calls_counted() {
        let message = Message {
            role: crate::llm::types::Role::Assistant,
            content: None,
            tool_calls: vec![ToolCall {
                id: "call-1".into(),
                name: "shell".into(),
                arguments: r#"{"command":"ls"}"#.into(),
            }],
            tool_call_id: None,
        };
        assert!(estimate_message_tokens(&message) > 4);
    }

    #[test]
    fn conversation_estimate_sums_messages() {
        let mut conv = Conversation::new("system prompt");
        let base = estimate_conversation_tokens(&conv);
        conv.push(Message::user("a question"));
        assert!(estimate_conversation_tokens(&conv) > base);
    }

    #[test]
    fn compaction_shrinks_estimate() {
        let mut conv = Conversation::new("sys");
        for _ in 0..20 {
            conv.push(Message::user(&"long message body ".repeat(50)));
            conv.push(Message::assistant(&"long reply body ".repeat(50)));
        }
        let before = estimate_conversation_tokens(&conv);
        conv.compact("short summary");
        assert!(estimate_conversation_tokens(&conv) <= before);
    }
}
