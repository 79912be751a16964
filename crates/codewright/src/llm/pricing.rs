use crate::llm::types::TokenUsage;

/// Estimate the cost in USD for a given model and token usage.
///
/// Returns `None` for unknown models. Pricing is per-million-token rates as
/// published by the providers.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> Option<f64> {
    let (input_per_m, output_per_m) = model_pricing(model)?;
    let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * input_per_m;
    let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * output_per_m;
    Some(input_cost + output_cost)
}

/// Return (input_per_million, output_per_million) pricing for a known model.
fn model_pricing(model: &str) -> Option<(f64, f64)> {
    match model {
        // OpenAI
        "gpt-4o" | "gpt-4o-2024-08-06" => Some((2.50, 10.0)),
        "gpt-4o-mini" | "gpt-4o-mini-2024-07-18" => Some((0.15, 0.60)),
        "gpt-4.1" => Some((2.0, 8.0)),
        "gpt-4.1-mini" => Some((0.40, 1.60)),
        "gpt-4.1-nano" => Some((0.10, 0.40)),
        "o4-mini" => Some((1.10, 4.40)),
        // Anthropic
        "claude-sonnet-4-20250514" => Some((3.0, 15.0)),
        "claude-opus-4-20250514" => Some((15.0, 75.0)),
        "claude-haiku-4-5-20251001" => Some((1.0, 5.0)),
        "claude-3-5-sonnet-20241022" => Some((3.0, 15.0)),
        "claude-3-5-haiku-20241022" => Some((0.80, 4.0)),
        // OpenRouter aliases
        "openai/gpt-4o" => Some((2.50, 10.0)),
        "openai/gpt-4o-mini" => Some((0.15, 0.60)),
        "anthropic/claude-sonnet-4" => Some((3.0, 15.0)),
        "anthropic/claude-3.5-sonnet" => Some((3.0, 15.0)),
        "anthropic/claude-3.5-haiku" => Some((0.80, 4.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt_4o_pricing() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        let cost = estimate_cost("gpt-4o", &usage).unwrap();
        // $2.50/M input + $10/M output = $12.50
        assert!((cost - 12.50).abs() < 0.001, "cost: {cost}");
    }

    #[test]
    fn sonnet_pricing() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        let cost = estimate_cost("claude-sonnet-4-20250514", &usage).unwrap();
        // $3/M input + $15/M output = $18
        assert!((cost - 18.0).abs() < 0.001, "cost: {cost}");
    }

    #[test]
    fn mini_pricing_fractional() {
        let usage = TokenUsage {
            input_tokens: 500_000,
            output_tokens: 100_000,
        };
        let cost = estimate_cost("gpt-4o-mini", &usage).unwrap();
        // 0.5M * $0.15 + 0.1M * $0.60 = $0.075 + $0.06 = $0.135
        assert!((cost - 0.135).abs() < 0.0001, "cost: {cost}");
    }

    #[test]
    fn unknown_model_returns_none() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        assert!(estimate_cost("some-local-model", &usage).is_none());
    }

    #[test]
    fn zero_usage_costs_zero() {
        let cost = estimate_cost("gpt-4o", &TokenUsage::default()).unwrap();
        assert!((cost - 0.0).abs() < f64::EPSILON, "cost: {cost}");
    }

    #[test]
    fn openrouter_aliases_match_native() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 0,
        };
        let native = estimate_cost("gpt-4o", &usage).unwrap();
        let alias = estimate_cost("openai/gpt-4o", &usage).unwrap();
        assert!((native - alias).abs() < f64::EPSILON);
    }
}
