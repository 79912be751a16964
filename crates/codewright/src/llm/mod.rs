pub mod error_class;
pub mod openai;
pub mod pricing;
pub mod retry;
pub mod stream;
pub mod types;

use std::pin::Pin;

use futures::Stream;

use crate::error::Error;
use crate::llm::types::{ChatRequest, ChatResponse, FinishReason, ResponseFragment, ToolCallDelta};

/// Stream of partial response fragments from a model backend.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<ResponseFragment, Error>> + Send>>;

/// Trait for model backends.
///
/// Implementors must be thread-safe (`Send + Sync`) to allow shared usage
/// across concurrent sessions.
pub trait ModelBackend: Send + Sync {
    /// Model identifier used for pricing and diagnostics.
    fn model_name(&self) -> &str;

    /// One-shot completion.
    fn complete(
        &self,
        request: ChatRequest,
    ) -> impl std::future::Future<Output = Result<ChatResponse, Error>> + Send;

    /// Streaming completion. The default implementation synthesizes a
    /// fragment stream from `complete()` so backends (and test mocks) that
    /// only implement the one-shot path still work with the streaming engine.
    fn complete_streaming(
        &self,
        request: ChatRequest,
    ) -> impl std::future::Future<Output = Result<FragmentStream, Error>> + Send {
        async move {
            let response = self.complete(request).await?;
            Ok(fragments_from_response(response))
        }
    }
}

/// Split a finalized response into the fragment shape the accumulator
/// consumes: one content/tool-call fragment followed by a terminal fragment
/// carrying usage and the finish reason.
pub fn fragments_from_response(response: ChatResponse) -> FragmentStream {
    let body = ResponseFragment {
        content: response.message.content.clone(),
        tool_calls: response
            .message
            .tool_calls
            .iter()
            .enumerate()
            .map(|(i, call)| ToolCallDelta {
                index: Some(i as u32),
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments: call.arguments.clone(),
            })
            .collect(),
        usage: None,
        finish_reason: None,
    };
    let tail = ResponseFragment {
        content: None,
        tool_calls: Vec::new(),
        usage: Some(response.usage),
        finish_reason: Some(
            match response.finish_reason {
                FinishReason::Stop => "stop",
                FinishReason::ToolCalls => "tool_calls",
                FinishReason::Length => "length",
            }
            .to_string(),
        ),
    };
    Box::pin(futures::stream::iter(vec![Ok(body), Ok(tail)]))
}
