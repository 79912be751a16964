use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalGate, ApprovalVerdict, Resolution};
use crate::config::{ContextConfig, LimitsConfig};
use crate::error::Error;
use crate::estimator::estimate_conversation_tokens;
use crate::llm::ModelBackend;
use crate::llm::error_class;
use crate::llm::stream::StreamAccumulator;
use crate::llm::types::{
    ChatRequest, Conversation, FinishReason, Message, TokenUsage, ToolCall,
};
use crate::middleware::{
    AutoCompact, ContextWarning, MiddlewareResult, Pipeline, SpendCap, TurnCap, TurnContext,
};
use crate::policy::authorize::{Authorization, Authorizer};
use crate::policy::mode::{Mode, ModePolicy};
use crate::policy::permission::CommandPolicy;
use crate::store::{SessionSnapshot, SessionStats, SessionStore};
use crate::tool::builtins::floor_char_boundary;
use crate::tool::{ToolOutput, ToolRegistry, validate_tool_input};

/// Maximum byte size for event payload strings.
const EVENT_MAX_PAYLOAD_BYTES: usize = 4096;

const SUMMARY_PROMPT: &str =
    "Summarize the conversation so far for a fresh context window: the task, \
     key decisions, files touched, current state, and what remains. Be \
     complete but concise; reply with the summary only.";

/// Events emitted while a turn executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Coalesced assistant text so far.
    AssistantText { text: String },
    ToolCallStarted {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    CompactStarted,
    CompactEnded { context_tokens: u32 },
}

/// Callback type for receiving turn events.
pub type OnTurnEvent = dyn Fn(&TurnEvent) + Send + Sync;

/// Result of one `act` call.
#[derive(Debug, Clone, Default)]
pub struct ActOutcome {
    /// The assistant's final text.
    pub final_text: String,
    /// Finish reason of the last model response, when one completed.
    pub finish_reason: Option<FinishReason>,
    /// Turns executed by this call.
    pub turns: usize,
    /// Tokens consumed by this call.
    pub usage: TokenUsage,
    /// Set when a middleware or cancellation stopped the loop.
    pub stopped_by: Option<String>,
}

/// Handle for cancelling an in-flight `act` call from another task.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    gate: Arc<ApprovalGate>,
}

impl CancelHandle {
    /// Stop dispatch of further tool calls and resolve any in-flight
    /// approval as NO.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.gate.cancel_all("turn cancelled by user");
    }
}

/// Drives turns for one conversation: queries the model through the
/// streaming accumulator, authorizes and runs requested tools, applies the
/// middleware pipeline, and persists a snapshot at every loop iteration.
///
/// `act` takes `&mut self`, so only one turn of a given conversation runs at
/// a time; independent sessions use independent engines.
pub struct Engine<B: ModelBackend> {
    backend: B,
    registry: ToolRegistry,
    authorizer: Authorizer,
    approval: Arc<ApprovalGate>,
    pipeline: Pipeline,
    store: Option<Arc<dyn SessionStore>>,
    on_event: Option<Arc<OnTurnEvent>>,
    shell_commands: Option<Arc<Mutex<CommandPolicy>>>,
    cancel: Arc<AtomicBool>,
    session_id: String,
    stats: SessionStats,
    max_tokens: u32,
    temperature: Option<f64>,
    stream_batch: usize,
    approval_ttl: Option<Duration>,
    max_tool_output_bytes: usize,
}

impl<B: ModelBackend> Engine<B> {
    pub fn builder(backend: B) -> EngineBuilder<B> {
        EngineBuilder {
            backend,
            registry: ToolRegistry::new(),
            modes: Arc::new(Mutex::new(ModePolicy::new(Mode::Normal))),
            approval: Arc::new(ApprovalGate::new()),
            pipeline: Pipeline::new(),
            store: None,
            on_event: None,
            shell_commands: None,
            session_id: Uuid::new_v4().to_string(),
            max_tokens: 4096,
            temperature: None,
            stream_batch: 8,
            approval_ttl: None,
            max_tool_output_bytes: 30_000,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn approval_gate(&self) -> Arc<ApprovalGate> {
        self.approval.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel.clone(),
            gate: self.approval.clone(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.authorizer
            .modes()
            .lock()
            .expect("mode policy lock poisoned")
            .current()
    }

    pub fn set_mode(&self, mode: Mode) {
        self.authorizer
            .modes()
            .lock()
            .expect("mode policy lock poisoned")
            .set_mode(mode);
    }

    pub fn cycle_mode(&self) -> Mode {
        self.authorizer
            .modes()
            .lock()
            .expect("mode policy lock poisoned")
            .cycle()
    }

    /// Drive one user request to completion. Not restartable: a fresh call
    /// resumes from the mutated conversation.
    pub async fn act(
        &mut self,
        conversation: &mut Conversation,
        user_text: &str,
    ) -> Result<ActOutcome, Error> {
        self.cancel.store(false, Ordering::SeqCst);
        conversation.push(Message::user(user_text));

        let result = self.run_loop(conversation).await;
        // Persist win or fail, before propagating anything.
        self.persist(conversation);
        if let Err(e) = &result {
            let class = error_class::classify(e);
            warn!(
                class = ?class,
                hint = class.recovery_hint(),
                error = %e,
                "turn failed"
            );
        }
        result
    }

    async fn run_loop(&mut self, conversation: &mut Conversation) -> Result<ActOutcome, Error> {
        let mut outcome = ActOutcome::default();

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.approval.cancel_all("turn cancelled by user");
                outcome.stopped_by = Some("cancelled".into());
                return Ok(outcome);
            }

            // (a) before-turn middleware, registration order, first
            // non-continue short-circuits the rest of the pipeline
            let before_ctx = self.turn_context(conversation, None);
            match self.pipeline.run_before(&before_ctx) {
                MiddlewareResult::Continue => {}
                MiddlewareResult::Stop(reason) => {
                    info!(reason = %reason, "stopped by middleware");
                    outcome.stopped_by = Some(reason);
                    return Ok(outcome);
                }
                MiddlewareResult::Inject(text) => conversation.push(Message::user(text)),
                MiddlewareResult::Compact => self.compact(conversation).await?,
            }

            // (b) query the model, one finalized assistant message
            conversation.check_ready_for_query()?;
            let request = ChatRequest {
                messages: conversation.messages().to_vec(),
                tools: self.registry.definitions(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            };
            let (assistant, finish, usage) = self.query_streaming(request).await?;

            outcome.usage += usage;
            self.stats.usage += usage;
            if let Some(text) = &assistant.content {
                outcome.final_text = text.clone();
            }

            let tool_calls = assistant.tool_calls.clone();
            conversation.push(assistant);

            // (c) resolve each requested tool call, results appended in
            // declaration order
            if !tool_calls.is_empty() {
                for result in self.run_tool_calls(&tool_calls).await {
                    conversation.push(result);
                }
            }

            outcome.turns += 1;
            self.stats.turns += 1;

            // (d) after-turn middleware
            let after_ctx = self.turn_context(conversation, Some(usage));
            let after = self.pipeline.run_after(&after_ctx);
            // Durability of partial progress: snapshot every iteration
            self.persist(conversation);
            match after {
                MiddlewareResult::Continue => {}
                MiddlewareResult::Stop(reason) => {
                    outcome.finish_reason = Some(finish);
                    outcome.stopped_by = Some(reason);
                    return Ok(outcome);
                }
                MiddlewareResult::Inject(text) => conversation.push(Message::user(text)),
                MiddlewareResult::Compact => self.compact(conversation).await?,
            }

            // (e) terminate once the model produced a final answer
            if tool_calls.is_empty() && finish != FinishReason::ToolCalls {
                outcome.finish_reason = Some(finish);
                return Ok(outcome);
            }
        }
    }

    async fn query_streaming(
        &self,
        request: ChatRequest,
    ) -> Result<(Message, FinishReason, TokenUsage), Error> {
        let mut stream = self.backend.complete_streaming(request).await?;
        let mut accumulator = StreamAccumulator::new(self.stream_batch);

        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            if let Some(text) = accumulator.push(&fragment)? {
                let text = text.to_string();
                self.emit(&TurnEvent::AssistantText { text });
            }
        }

        accumulator.finish()
    }

    /// Authorize sequentially (approval gates are interactive), then run the
    /// approved calls concurrently and reassemble results in the order the
    /// model declared them.
    async fn run_tool_calls(&mut self, calls: &[ToolCall]) -> Vec<Message> {
        enum Planned {
            Ready(ToolOutput),
            Execute(serde_json::Value),
        }

        let mut plan: Vec<Planned> = Vec::with_capacity(calls.len());

        for call in calls {
            self.emit(&TurnEvent::ToolCallStarted {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: truncate_for_event(&call.arguments),
            });

            if self.cancel.load(Ordering::SeqCst) {
                plan.push(Planned::Ready(ToolOutput::error(
                    "not dispatched: turn cancelled by user",
                )));
                continue;
            }

            let args = match call.parsed_arguments() {
                Ok(args) => args,
                Err(e) => {
                    plan.push(Planned::Ready(ToolOutput::error(format!(
                        "invalid tool arguments: {e}"
                    ))));
                    continue;
                }
            };

            let Some(tool) = self.registry.get(&call.name) else {
                plan.push(Planned::Ready(ToolOutput::error(format!(
                    "tool not found: {}",
                    call.name
                ))));
                continue;
            };

            if let Err(message) = validate_tool_input(&tool.definition().input_schema, &args) {
                plan.push(Planned::Ready(ToolOutput::error(message)));
                continue;
            }

            let static_permission = tool.permission(&args);
            match self.authorizer.authorize(&call.name, &args, static_permission) {
                Authorization::Skip(reason) => {
                    debug!(tool = %call.name, reason = %reason, "tool call skipped");
                    plan.push(Planned::Ready(ToolOutput::error(reason)));
                }
                Authorization::Execute => plan.push(Planned::Execute(args)),
                Authorization::AwaitApproval => {
                    let resolution = self.await_approval(&call.name, &args).await;
                    match resolution.verdict {
                        ApprovalVerdict::Yes => plan.push(Planned::Execute(args)),
                        ApprovalVerdict::Always => {
                            self.record_always_rule(&call.name, &args);
                            plan.push(Planned::Execute(args));
                        }
                        ApprovalVerdict::No => {
                            let detail = resolution
                                .message
                                .unwrap_or_else(|| "no reason given".into());
                            plan.push(Planned::Ready(ToolOutput::error(format!(
                                "approval denied: {detail}"
                            ))));
                        }
                    }
                }
            }
        }

        // Concurrent dispatch of the approved calls; buffered and
        // re-sequenced by declaration index before appending.
        let mut join_set = tokio::task::JoinSet::new();
        let mut outputs: Vec<Option<ToolOutput>> = Vec::with_capacity(calls.len());
        for (idx, planned) in plan.into_iter().enumerate() {
            match planned {
                Planned::Ready(output) => outputs.push(Some(output)),
                Planned::Execute(args) => match self.registry.get(&calls[idx].name).cloned() {
                    Some(tool) => {
                        outputs.push(None);
                        join_set.spawn(async move {
                            let output = match tool.execute(args).await {
                                Ok(output) => output,
                                // Component-local errors become structured
                                // tool-result content so the model can react
                                Err(e) => ToolOutput::error(e.to_string()),
                            };
                            (idx, output)
                        });
                    }
                    None => outputs.push(Some(ToolOutput::error(format!(
                        "tool not found: {}",
                        calls[idx].name
                    )))),
                },
            }
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, output)) => outputs[idx] = Some(output),
                Err(e) => warn!(error = %e, "tool task panicked"),
            }
        }

        calls
            .iter()
            .zip(outputs)
            .map(|(call, output)| {
                let output = output
                    .unwrap_or_else(|| ToolOutput::error("tool task panicked"))
                    .truncated(self.max_tool_output_bytes);
                self.emit(&TurnEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    content: truncate_for_event(&output.content),
                    is_error: output.is_error,
                });
                let content = if output.is_error {
                    format!("[ERROR] {}", output.content)
                } else {
                    output.content
                };
                Message::tool_result(&call.id, content)
            })
            .collect()
    }

    async fn await_approval(&self, tool_name: &str, args: &serde_json::Value) -> Resolution {
        let correlation_id = Uuid::new_v4().to_string();
        let rx = self.approval.request_approval(tool_name, args, &correlation_id);

        let closed = || Resolution {
            verdict: ApprovalVerdict::No,
            message: Some("approval channel closed".into()),
        };

        match self.approval_ttl {
            Some(ttl) => match tokio::time::timeout(ttl, rx).await {
                Ok(Ok(resolution)) => resolution,
                Ok(Err(_)) => closed(),
                Err(_) => {
                    // Receiver was dropped by the elapsed timeout; remove
                    // the table entry so it cannot fire later.
                    self.approval
                        .resolve(&correlation_id, ApprovalVerdict::No, None);
                    Resolution {
                        verdict: ApprovalVerdict::No,
                        message: Some("approval request expired".into()),
                    }
                }
            },
            None => rx.await.unwrap_or_else(|_| closed()),
        }
    }

    fn record_always_rule(&self, tool_name: &str, args: &serde_json::Value) {
        if tool_name != "shell" {
            return;
        }
        let Some(commands) = &self.shell_commands else {
            return;
        };
        if let Some(command) = args.get("command").and_then(|v| v.as_str()) {
            commands
                .lock()
                .expect("command policy lock poisoned")
                .add_allow_rule(command);
            info!(command, "recorded allow rule from always verdict");
        }
    }

    /// Replace the conversation with `[system, summary]` synthesized by the
    /// model.
    pub async fn compact(&mut self, conversation: &mut Conversation) -> Result<(), Error> {
        self.emit(&TurnEvent::CompactStarted);

        let mut messages = conversation.messages().to_vec();
        messages.push(Message::user(SUMMARY_PROMPT));
        let request = ChatRequest {
            messages,
            tools: Vec::new(),
            max_tokens: self.max_tokens,
            temperature: None,
        };
        let response = self.backend.complete(request).await?;
        self.stats.usage += response.usage;

        let summary = response.message.text().to_string();
        conversation.compact(format!("Summary of the conversation so far:\n\n{summary}"));
        self.pipeline.on_compact();

        let context_tokens = estimate_conversation_tokens(conversation);
        info!(context_tokens, "conversation compacted");
        self.emit(&TurnEvent::CompactEnded { context_tokens });
        Ok(())
    }

    /// Drop the history (system message survives) and fully reset the
    /// middleware pipeline and session counters.
    pub fn clear(&mut self, conversation: &mut Conversation) {
        conversation.clear();
        self.pipeline.on_clear();
        self.stats = SessionStats::default();
    }

    fn turn_context(&self, conversation: &Conversation, turn_usage: Option<TokenUsage>) -> TurnContext {
        TurnContext {
            turns_completed: self.stats.turns,
            context_tokens: estimate_conversation_tokens(conversation),
            turn_usage,
            model: self.backend.model_name().to_string(),
        }
    }

    fn persist(&self, conversation: &Conversation) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = SessionSnapshot {
            id: self.session_id.clone(),
            conversation: conversation.clone(),
            stats: self.stats.clone(),
            mode: self.mode(),
            updated_at: chrono::Utc::now(),
        };
        // Best-effort durability; a failing store must not take the turn down
        if let Err(e) = store.save_interaction(&snapshot) {
            warn!(error = %e, "failed to persist session snapshot");
        }
    }

    fn emit(&self, event: &TurnEvent) {
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }
}

fn truncate_for_event(text: &str) -> String {
    if text.len() <= EVENT_MAX_PAYLOAD_BYTES {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, EVENT_MAX_PAYLOAD_BYTES);
    format!("{}[truncated: {} bytes omitted]", &text[..cut], text.len() - cut)
}

pub struct EngineBuilder<B: ModelBackend> {
    backend: B,
    registry: ToolRegistry,
    modes: Arc<Mutex<ModePolicy>>,
    approval: Arc<ApprovalGate>,
    pipeline: Pipeline,
    store: Option<Arc<dyn SessionStore>>,
    on_event: Option<Arc<OnTurnEvent>>,
    shell_commands: Option<Arc<Mutex<CommandPolicy>>>,
    session_id: String,
    max_tokens: u32,
    temperature: Option<f64>,
    stream_batch: usize,
    approval_ttl: Option<Duration>,
    max_tool_output_bytes: usize,
}

impl<B: ModelBackend> EngineBuilder<B> {
    pub fn tool(mut self, tool: Arc<dyn crate::tool::Tool>) -> Self {
        self.registry.register(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<Arc<dyn crate::tool::Tool>>) -> Self {
        for tool in tools {
            self.registry.register(tool);
        }
        self
    }

    pub fn initial_mode(self, mode: Mode) -> Self {
        self.modes
            .lock()
            .expect("mode policy lock poisoned")
            .set_mode(mode);
        self
    }

    /// Share a mode policy across collaborators (status line, session
    /// surface).
    pub fn mode_policy(mut self, modes: Arc<Mutex<ModePolicy>>) -> Self {
        self.modes = modes;
        self
    }

    pub fn approval_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.approval = gate;
        self
    }

    pub fn middleware(mut self, middleware: Box<dyn crate::middleware::TurnMiddleware>) -> Self {
        self.pipeline.register(middleware);
        self
    }

    /// Register the built-in policies for the configured limits: turn cap,
    /// spend cap, auto-compaction, context warning, in that order.
    pub fn standard_middleware(mut self, limits: &LimitsConfig, context: &ContextConfig) -> Self {
        self.pipeline.register(Box::new(TurnCap::new(limits.max_turns)));
        if let Some(max_spend) = limits.max_spend_usd {
            self.pipeline.register(Box::new(SpendCap::new(max_spend)));
        }
        self.pipeline
            .register(Box::new(AutoCompact::new(context.compact_threshold_tokens)));
        self.pipeline
            .register(Box::new(ContextWarning::new(context.warn_threshold_tokens)));
        self.stream_batch = context.stream_batch_size;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn on_event(mut self, on_event: Arc<OnTurnEvent>) -> Self {
        self.on_event = Some(on_event);
        self
    }

    /// Command policy handle used to record learned allow rules from
    /// "always" approval verdicts.
    pub fn shell_commands(mut self, commands: Arc<Mutex<CommandPolicy>>) -> Self {
        self.shell_commands = Some(commands);
        self
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Coalesce streamed text events every N content fragments (1 = every
    /// fragment).
    pub fn stream_batch(mut self, batch: usize) -> Self {
        self.stream_batch = batch;
        self
    }

    /// Deadline for approval waits. Without one, a waiting turn suspends
    /// until the gate resolves.
    pub fn approval_ttl(mut self, ttl: Duration) -> Self {
        self.approval_ttl = Some(ttl);
        self
    }

    pub fn max_tool_output_bytes(mut self, max: usize) -> Self {
        self.max_tool_output_bytes = max;
        self
    }

    pub fn build(self) -> Engine<B> {
        Engine {
            backend: self.backend,
            registry: self.registry,
            authorizer: Authorizer::new(self.modes),
            approval: self.approval,
            pipeline: self.pipeline,
            store: self.store,
            on_event: self.on_event,
            shell_commands: self.shell_commands,
            cancel: Arc::new(AtomicBool::new(false)),
            session_id: self.session_id,
            stats: SessionStats::default(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream_batch: self.stream_batch,
            approval_ttl: self.approval_ttl,
            max_tool_output_bytes: self.max_tool_output_bytes,
        }
    }
}
