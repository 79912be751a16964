use crate::llm::pricing;
use crate::llm::types::TokenUsage;

/// Snapshot of turn-boundary state handed to each middleware.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    /// Turns completed so far in the session.
    pub turns_completed: usize,
    /// Current conversation token estimate.
    pub context_tokens: u32,
    /// Usage of the turn that just finished (after-turn only).
    pub turn_usage: Option<TokenUsage>,
    /// Model identifier, for cost lookups.
    pub model: String,
}

/// Decision of one middleware at a turn boundary. Consumed once; never
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum MiddlewareResult {
    Continue,
    /// Stop the loop, reporting why.
    Stop(String),
    /// Append a reminder message to the conversation before querying.
    Inject(String),
    /// Replace the conversation with a synthesized summary.
    Compact,
}

/// A turn-boundary policy. Policies are stateless with respect to each
/// other; evaluation order is registration order.
pub trait TurnMiddleware: Send {
    fn name(&self) -> &'static str;

    fn before_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        MiddlewareResult::Continue
    }

    fn after_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        MiddlewareResult::Continue
    }

    /// Full reset on conversation clear.
    fn on_clear(&mut self) {}

    /// Partial reset after compaction. Spend/turn counters survive; context
    /// latches reset.
    fn on_compact(&mut self) {}
}

/// Ordered middleware chain, short-circuiting at the first non-Continue
/// result.
#[derive(Default)]
pub struct Pipeline {
    middlewares: Vec<Box<dyn TurnMiddleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, middleware: Box<dyn TurnMiddleware>) {
        self.middlewares.push(middleware);
    }

    pub fn run_before(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        for middleware in &mut self.middlewares {
            let result = middleware.before_turn(ctx);
            if result != MiddlewareResult::Continue {
                tracing::debug!(middleware = middleware.name(), ?result, "before-turn short-circuit");
                return result;
            }
        }
        MiddlewareResult::Continue
    }

    pub fn run_after(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        for middleware in &mut self.middlewares {
            let result = middleware.after_turn(ctx);
            if result != MiddlewareResult::Continue {
                tracing::debug!(middleware = middleware.name(), ?result, "after-turn short-circuit");
                return result;
            }
        }
        MiddlewareResult::Continue
    }

    pub fn on_clear(&mut self) {
        for middleware in &mut self.middlewares {
            middleware.on_clear();
        }
    }

    pub fn on_compact(&mut self) {
        for middleware in &mut self.middlewares {
            middleware.on_compact();
        }
    }
}

// --- Built-in policies ---

/// Stops the loop once the configured number of turns has run.
pub struct TurnCap {
    max_turns: usize,
    turns_seen: usize,
}

impl TurnCap {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            turns_seen: 0,
        }
    }
}

impl TurnMiddleware for TurnCap {
    fn name(&self) -> &'static str {
        "turn_cap"
    }

    fn before_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        if self.turns_seen >= self.max_turns {
            return MiddlewareResult::Stop(format!(
                "turn limit reached ({} turns)",
                self.max_turns
            ));
        }
        MiddlewareResult::Continue
    }

    fn after_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        self.turns_seen += 1;
        MiddlewareResult::Continue
    }

    fn on_clear(&mut self) {
        self.turns_seen = 0;
    }

    // Turn count survives compaction.
}

/// Stops the loop once cumulative spend exceeds the ceiling.
pub struct SpendCap {
    max_spend_usd: f64,
    spent_usd: f64,
}

impl SpendCap {
    pub fn new(max_spend_usd: f64) -> Self {
        Self {
            max_spend_usd,
            spent_usd: 0.0,
        }
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_usd
    }
}

impl TurnMiddleware for SpendCap {
    fn name(&self) -> &'static str {
        "spend_cap"
    }

    fn before_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        if self.spent_usd >= self.max_spend_usd {
            return MiddlewareResult::Stop(format!(
                "spend limit reached (${:.4} of ${:.2})",
                self.spent_usd, self.max_spend_usd
            ));
        }
        MiddlewareResult::Continue
    }

    fn after_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if let Some(usage) = &ctx.turn_usage
            && let Some(cost) = pricing::estimate_cost(&ctx.model, usage)
        {
            self.spent_usd += cost;
        }
        MiddlewareResult::Continue
    }

    fn on_clear(&mut self) {
        self.spent_usd = 0.0;
    }

    // Spend survives compaction: summarizing history does not refund cost.
}

/// Requests compaction once the context estimate crosses the threshold.
pub struct AutoCompact {
    threshold_tokens: u32,
}

impl AutoCompact {
    pub fn new(threshold_tokens: u32) -> Self {
        Self { threshold_tokens }
    }
}

impl TurnMiddleware for AutoCompact {
    fn name(&self) -> &'static str {
        "auto_compact"
    }

    fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.context_tokens >= self.threshold_tokens {
            return MiddlewareResult::Compact;
        }
        MiddlewareResult::Continue
    }
}

/// Injects a one-shot reminder once the context estimate crosses a softer
/// threshold.
pub struct ContextWarning {
    threshold_tokens: u32,
    warned: bool,
}

impl ContextWarning {
    pub fn new(threshold_tokens: u32) -> Self {
        Self {
            threshold_tokens,
            warned: false,
        }
    }
}

impl TurnMiddleware for ContextWarning {
    fn name(&self) -> &'static str {
        "context_warning"
    }

    fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if !self.warned && ctx.context_tokens >= self.threshold_tokens {
            self.warned = true;
            return MiddlewareResult::Inject(format!(
                "Note: the conversation is using roughly {} tokens of context. \
                 Prefer concise tool output and consider wrapping up.",
                ctx.context_tokens
            ));
        }
        MiddlewareResult::Continue
    }

    fn on_clear(&mut self) {
        self.warned = false;
    }

    fn on_compact(&mut self) {
        self.warned = false;
    }
}
