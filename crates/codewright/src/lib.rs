pub mod approval;
pub mod config;
pub mod engine;
pub mod error;
mod estimator;
pub mod exec;
pub mod llm;
pub mod middleware;
pub mod policy;
pub mod store;
pub mod tool;

pub use approval::{ApprovalGate, ApprovalVerdict, OnApprovalRequest, Resolution};
pub use config::CodewrightConfig;
pub use engine::{ActOutcome, CancelHandle, Engine, OnTurnEvent, TurnEvent};
pub use error::Error;
pub use exec::{ExecError, ExecOutcome, ExecutionState, SecureExecutor};
pub use llm::openai::OpenAiBackend;
pub use llm::retry::{RetryConfig, RetryingBackend};
pub use llm::stream::StreamAccumulator;
pub use llm::types::{
    ChatRequest, ChatResponse, Conversation, FinishReason, Message, ResponseFragment, Role,
    TokenUsage, ToolCall, ToolCallDelta, ToolDefinition,
};
pub use llm::{FragmentStream, ModelBackend};
pub use middleware::{
    AutoCompact, ContextWarning, MiddlewareResult, Pipeline, SpendCap, TurnCap, TurnContext,
    TurnMiddleware,
};
pub use policy::authorize::{Authorization, Authorizer};
pub use policy::mode::{Mode, ModePolicy};
pub use policy::permission::{CommandPolicy, ToolPermission};
pub use store::{JsonSessionStore, SessionSnapshot, SessionStats, SessionStore};
pub use tool::builtins::{
    EditFileTool, ListDirTool, ReadFileTool, ShellTool, WriteFileTool, file_tools,
};
pub use tool::{Tool, ToolOutput, ToolRegistry, validate_tool_input};
