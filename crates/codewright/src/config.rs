use serde::Deserialize;

use crate::error::Error;
use crate::policy::mode::Mode;

/// Top-level configuration loaded from `codewright.toml`.
#[derive(Debug, Deserialize)]
pub struct CodewrightConfig {
    pub provider: ProviderConfig,
    /// Mode the session starts in.
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub commands: CommandListsConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_mode() -> Mode {
    Mode::Normal
}

/// Model backend configuration.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    /// Override for OpenAI-compatible endpoints (local servers, proxies).
    pub base_url: Option<String>,
    /// Retry configuration for transient backend failures.
    pub retry: Option<RetryBackendConfig>,
}

/// Retry configuration for transient backend failures (429, 5xx, network).
#[derive(Debug, Deserialize)]
pub struct RetryBackendConfig {
    /// Maximum retry attempts (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff (default: 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Hard limits enforced by the turn pipeline.
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum turns per `act` call before the loop stops.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Cumulative spend ceiling in USD. `None` disables the cap.
    pub max_spend_usd: Option<f64>,
    /// Maximum tokens requested per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_turns() -> usize {
    25
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_spend_usd: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Context-window management thresholds.
#[derive(Debug, Deserialize)]
pub struct ContextConfig {
    /// Token estimate at which the conversation is auto-compacted.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold_tokens: u32,
    /// Lower token estimate at which a reminder is injected.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold_tokens: u32,
    /// Coalesce streamed text events every N content fragments (1 = every
    /// fragment, the deterministic mode used by tests).
    #[serde(default = "default_stream_batch")]
    pub stream_batch_size: usize,
}

fn default_compact_threshold() -> u32 {
    80_000
}

fn default_warn_threshold() -> u32 {
    60_000
}

fn default_stream_batch() -> usize {
    8
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            compact_threshold_tokens: default_compact_threshold(),
            warn_threshold_tokens: default_warn_threshold(),
            stream_batch_size: default_stream_batch(),
        }
    }
}

/// Allow/deny glob lists for the shell tool.
#[derive(Debug, Deserialize, Default)]
pub struct CommandListsConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Secure executor settings.
#[derive(Debug, Deserialize)]
pub struct ExecutorConfig {
    /// Executables the executor may spawn.
    #[serde(default = "default_allowed_executables")]
    pub allowed: Vec<String>,
    /// Per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,
}

fn default_allowed_executables() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "grep", "find", "pwd", "echo", "wc", "sort", "uniq", "diff",
        "git", "cargo", "make", "sed", "awk", "env", "which", "sh", "rm", "mv", "cp", "mkdir",
        "touch",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_command_timeout() -> u64 {
    120
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allowed: default_allowed_executables(),
            timeout_seconds: default_command_timeout(),
        }
    }
}

impl CodewrightConfig {
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = CodewrightConfig::from_toml(
            r#"
            [provider]
            name = "openai"
            model = "gpt-4o"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Normal);
        assert_eq!(config.limits.max_turns, 25);
        assert!(config.limits.max_spend_usd.is_none());
        assert_eq!(config.context.compact_threshold_tokens, 80_000);
        assert_eq!(config.context.warn_threshold_tokens, 60_000);
        assert_eq!(config.context.stream_batch_size, 8);
        assert_eq!(config.executor.timeout_seconds, 120);
        assert!(config.executor.allowed.iter().any(|e| e == "git"));
        assert!(config.commands.allow.is_empty());
        assert!(config.provider.retry.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = CodewrightConfig::from_toml(
            r#"
            mode = "plan"

            [provider]
            name = "openai"
            model = "gpt-4o-mini"
            base_url = "http://localhost:8080/v1/chat/completions"

            [provider.retry]
            max_retries = 5

            [limits]
            max_turns = 10
            max_spend_usd = 2.5
            max_tokens = 2048

            [context]
            compact_threshold_tokens = 40000
            warn_threshold_tokens = 30000
            stream_batch_size = 1

            [commands]
            allow = ["ls *", "git status"]
            deny = ["rm *"]

            [executor]
            allowed = ["ls", "git"]
            timeout_seconds = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Plan);
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert!(config.provider.base_url.is_some());
        let retry = config.provider.retry.unwrap();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.base_delay_ms, 500); // default kept
        assert_eq!(config.limits.max_spend_usd, Some(2.5));
        assert_eq!(config.context.stream_batch_size, 1);
        assert_eq!(config.commands.deny, vec!["rm *"]);
        assert_eq!(config.executor.allowed.len(), 2);
        assert_eq!(config.executor.timeout_seconds, 30);
    }

    #[test]
    fn missing_provider_is_error() {
        let err = CodewrightConfig::from_toml("mode = \"auto\"").unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err =
            CodewrightConfig::from_file(std::path::Path::new("/nonexistent/codewright.toml"))
                .unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codewright.toml");
        std::fs::write(&path, "[provider]\nname = \"openai\"\nmodel = \"gpt-4o\"\n").unwrap();

        let config = CodewrightConfig::from_file(&path).unwrap();
        assert_eq!(config.provider.name, "openai");
    }
}
