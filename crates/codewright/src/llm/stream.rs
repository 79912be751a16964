use std::collections::HashMap;

use crate::error::Error;
use crate::llm::types::{
    FinishReason, Message, ResponseFragment, Role, TokenUsage, ToolCall,
};

/// Reassembles one assistant message from a sequence of response fragments.
///
/// Text deltas are concatenated into a single content buffer and re-emitted
/// as coalesced "text so far" snapshots every `batch_every` content-bearing
/// fragments, bounding UI update frequency. Tool-call argument deltas are
/// concatenated per `index` in arrival order; the first-seen order of indices
/// is preserved in the final message.
///
/// The finish reason recorded on the final message is the first non-null
/// finish reason seen across all fragments. Usage is taken from the last
/// fragment that carries it; a stream that ends without any usage-bearing
/// fragment is a fatal condition for the turn.
pub struct StreamAccumulator {
    batch_every: usize,
    content: String,
    content_fragments_since_emit: usize,
    tool_calls: Vec<PartialToolCall>,
    by_index: HashMap<u32, usize>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
}

struct PartialToolCall {
    index: u32,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl StreamAccumulator {
    /// `batch_every` of 0 is clamped to 1 (every content fragment emits).
    pub fn new(batch_every: usize) -> Self {
        Self {
            batch_every: batch_every.max(1),
            content: String::new(),
            content_fragments_since_emit: 0,
            tool_calls: Vec::new(),
            by_index: HashMap::new(),
            finish_reason: None,
            usage: None,
        }
    }

    /// Deterministic mode: one coalesced emit per content-bearing fragment.
    pub fn deterministic() -> Self {
        Self::new(1)
    }

    /// Consume one fragment. Returns the accumulated text when a coalesced
    /// emit is due, `None` otherwise.
    pub fn push(&mut self, fragment: &ResponseFragment) -> Result<Option<&str>, Error> {
        for delta in &fragment.tool_calls {
            let index = delta.index.ok_or_else(|| {
                Error::MalformedStream(format!(
                    "tool call delta without index (id={:?}, name={:?})",
                    delta.id, delta.name
                ))
            })?;

            match self.by_index.get(&index) {
                Some(&slot) => {
                    let partial = &mut self.tool_calls[slot];
                    if partial.id.is_none() {
                        partial.id = delta.id.clone();
                    }
                    if partial.name.is_none() {
                        partial.name = delta.name.clone();
                    }
                    partial.arguments.push_str(&delta.arguments);
                }
                None => {
                    self.by_index.insert(index, self.tool_calls.len());
                    self.tool_calls.push(PartialToolCall {
                        index,
                        id: delta.id.clone(),
                        name: delta.name.clone(),
                        arguments: delta.arguments.clone(),
                    });
                }
            }
        }

        if self.finish_reason.is_none() {
            self.finish_reason = fragment.finish_reason.clone();
        }
        if let Some(usage) = fragment.usage {
            self.usage = Some(usage);
        }

        if let Some(text) = &fragment.content {
            self.content.push_str(text);
            self.content_fragments_since_emit += 1;
            if self.content_fragments_since_emit >= self.batch_every {
                self.content_fragments_since_emit = 0;
                return Ok(Some(&self.content));
            }
        }

        Ok(None)
    }

    /// Finalize the message once the fragment sequence has ended.
    pub fn finish(self) -> Result<(Message, FinishReason, TokenUsage), Error> {
        let usage = self.usage.ok_or(Error::MissingUsage)?;

        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .map(|partial| ToolCall {
                // A stream that never names a call id still needs a stable
                // correlation key for the tool-result message.
                id: partial
                    .id
                    .unwrap_or_else(|| format!("call_{}", partial.index)),
                name: partial.name.unwrap_or_default(),
                arguments: partial.arguments,
            })
            .collect();

        let finish_reason = self
            .finish_reason
            .as_deref()
            .map(FinishReason::parse)
            .unwrap_or(FinishReason::Stop);

        let message = Message {
            role: Role::Assistant,
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
            tool_call_id: None,
        };

        Ok((message, finish_reason, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolCallDelta;

    fn text_fragment(text: &str) -> ResponseFragment {
        ResponseFragment {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    fn tail_fragment(finish: &str, input: u32, output: u32) -> ResponseFragment {
        ResponseFragment {
            usage: Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
            }),
            finish_reason: Some(finish.into()),
            ..Default::default()
        }
    }

    fn args_delta(index: u32, args: &str) -> ResponseFragment {
        ResponseFragment {
            tool_calls: vec![ToolCallDelta {
                index: Some(index),
                id: None,
                name: None,
                arguments: args.into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn text_accumulates_across_fragments() {
        let mut acc = StreamAccumulator::deterministic();
        assert_eq!(acc.push(&text_fragment("Hello ")).unwrap(), Some("Hello "));
        assert_eq!(
            acc.push(&text_fragment("world!")).unwrap(),
            Some("Hello world!")
        );
        acc.push(&tail_fragment("stop", 10, 5)).unwrap();

        let (message, finish, usage) = acc.finish().unwrap();
        assert_eq!(message.text(), "Hello world!");
        assert_eq!(finish, FinishReason::Stop);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn batching_coalesces_text_events() {
        let mut acc = StreamAccumulator::new(3);
        assert_eq!(acc.push(&text_fragment("a")).unwrap(), None);
        assert_eq!(acc.push(&text_fragment("b")).unwrap(), None);
        // Third content fragment triggers a coalesced emit of everything so far
        assert_eq!(acc.push(&text_fragment("c")).unwrap(), Some("abc"));
        assert_eq!(acc.push(&text_fragment("d")).unwrap(), None);
    }

    #[test]
    fn non_content_fragments_do_not_count_toward_batch() {
        let mut acc = StreamAccumulator::new(2);
        assert_eq!(acc.push(&text_fragment("a")).unwrap(), None);
        assert_eq!(acc.push(&args_delta(0, "{}")).unwrap(), None);
        assert_eq!(acc.push(&text_fragment("b")).unwrap(), Some("ab"));
    }

    #[test]
    fn tool_call_arguments_merge_by_index() {
        let mut acc = StreamAccumulator::deterministic();
        acc.push(&ResponseFragment {
            tool_calls: vec![ToolCallDelta {
                index: Some(0),
                id: Some("call_abc".into()),
                name: Some("shell".into()),
                arguments: r#"{"comm"#.into(),
            }],
            ..Default::default()
        })
        .unwrap();
        acc.push(&args_delta(0, r#"and":"ls"}"#)).unwrap();
        acc.push(&tail_fragment("tool_calls", 20, 10)).unwrap();

        let (message, finish, _) = acc.finish().unwrap();
        assert_eq!(finish, FinishReason::ToolCalls);
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "call_abc");
        assert_eq!(message.tool_calls[0].name, "shell");
        assert_eq!(message.tool_calls[0].arguments, r#"{"command":"ls"}"#);
    }

    #[test]
    fn first_seen_index_order_preserved() {
        let mut acc = StreamAccumulator::deterministic();
        // Index 1 arrives before index 0; argument deltas then interleave
        acc.push(&ResponseFragment {
            tool_calls: vec![ToolCallDelta {
                index: Some(1),
                id: Some("b".into()),
                name: Some("read_file".into()),
                arguments: "{".into(),
            }],
            ..Default::default()
        })
        .unwrap();
        acc.push(&ResponseFragment {
            tool_calls: vec![ToolCallDelta {
                index: Some(0),
                id: Some("a".into()),
                name: Some("shell".into()),
                arguments: "{}".into(),
            }],
            ..Default::default()
        })
        .unwrap();
        acc.push(&args_delta(1, "}")).unwrap();
        acc.push(&tail_fragment("tool_calls", 1, 1)).unwrap();

        let (message, _, _) = acc.finish().unwrap();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[0].id, "b");
        assert_eq!(message.tool_calls[0].arguments, "{}");
        assert_eq!(message.tool_calls[1].id, "a");
    }

    #[test]
    fn repeated_index_never_dropped() {
        let mut acc = StreamAccumulator::deterministic();
        for chunk in ["a", "b", "c", "d"] {
            acc.push(&args_delta(0, chunk)).unwrap();
        }
        acc.push(&tail_fragment("tool_calls", 1, 1)).unwrap();
        let (message, _, _) = acc.finish().unwrap();
        assert_eq!(message.tool_calls[0].arguments, "abcd");
    }

    #[test]
    fn missing_index_is_malformed_stream() {
        let mut acc = StreamAccumulator::deterministic();
        let err = acc
            .push(&ResponseFragment {
                tool_calls: vec![ToolCallDelta {
                    index: None,
                    id: Some("call_x".into()),
                    name: Some("shell".into()),
                    arguments: "{}".into(),
                }],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::MalformedStream(_)));
        assert!(err.to_string().contains("without index"), "err: {err}");
    }

    #[test]
    fn missing_usage_is_fatal() {
        let mut acc = StreamAccumulator::deterministic();
        acc.push(&text_fragment("hi")).unwrap();
        acc.push(&ResponseFragment {
            finish_reason: Some("stop".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(acc.finish(), Err(Error::MissingUsage)));
    }

    #[test]
    fn first_finish_reason_wins() {
        let mut acc = StreamAccumulator::deterministic();
        acc.push(&ResponseFragment {
            finish_reason: Some("tool_calls".into()),
            ..Default::default()
        })
        .unwrap();
        // A later fragment with a different finish reason must not override
        acc.push(&tail_fragment("stop", 1, 1)).unwrap();
        let (_, finish, _) = acc.finish().unwrap();
        assert_eq!(finish, FinishReason::ToolCalls);
    }

    #[test]
    fn usage_from_last_bearing_fragment() {
        let mut acc = StreamAccumulator::deterministic();
        acc.push(&ResponseFragment {
            usage: Some(TokenUsage {
                input_tokens: 5,
                output_tokens: 0,
            }),
            ..Default::default()
        })
        .unwrap();
        acc.push(&tail_fragment("stop", 100, 42)).unwrap();
        let (_, _, usage) = acc.finish().unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 42);
    }

    #[test]
    fn missing_call_id_synthesized_from_index() {
        let mut acc = StreamAccumulator::deterministic();
        acc.push(&ResponseFragment {
            tool_calls: vec![ToolCallDelta {
                index: Some(2),
                id: None,
                name: Some("shell".into()),
                arguments: "{}".into(),
            }],
            ..Default::default()
        })
        .unwrap();
        acc.push(&tail_fragment("tool_calls", 1, 1)).unwrap();
        let (message, _, _) = acc.finish().unwrap();
        assert_eq!(message.tool_calls[0].id, "call_2");
    }

    #[test]
    fn empty_content_becomes_none() {
        let mut acc = StreamAccumulator::deterministic();
        acc.push(&args_delta(0, "{}")).unwrap();
        acc.push(&tail_fragment("tool_calls", 1, 1)).unwrap();
        let (message, _, _) = acc.finish().unwrap();
        assert!(message.content.is_none());
    }
}
