use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::error::Error;
use crate::exec::SecureExecutor;
use crate::llm::types::ToolDefinition;
use crate::policy::permission::{CommandPolicy, ToolPermission};
use crate::tool::{Tool, ToolOutput};

const MAX_TIMEOUT_SECONDS: u64 = 600;

/// Runs shell-like commands through the secure executor.
///
/// The allow/deny command lists live behind a shared handle so "always"
/// approval verdicts can append learned allow rules at runtime.
pub struct ShellTool {
    executor: Arc<SecureExecutor>,
    commands: Arc<Mutex<CommandPolicy>>,
    default_timeout: Duration,
}

impl ShellTool {
    pub fn new(
        executor: Arc<SecureExecutor>,
        commands: Arc<Mutex<CommandPolicy>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            commands,
            default_timeout,
        }
    }

    pub fn command_policy(&self) -> &Arc<Mutex<CommandPolicy>> {
        &self.commands
    }
}

impl Tool for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "shell".into(),
            description: format!(
                "Execute a single command. Working directory persists between \
                 calls (use `cd`). Captures stdout and stderr. Default timeout: \
                 {}s, max: {MAX_TIMEOUT_SECONDS}s.",
                self.default_timeout.as_secs()
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The command to execute"
                    },
                    "timeout_seconds": {
                        "type": "number",
                        "description": "Timeout in seconds"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    fn permission(&self, input: &serde_json::Value) -> ToolPermission {
        let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
        self.commands
            .lock()
            .expect("command policy lock poisoned")
            .evaluate(command)
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("command is required".into()))?;

            let timeout = input
                .get("timeout_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.default_timeout.as_secs())
                .min(MAX_TIMEOUT_SECONDS);

            match self
                .executor
                .execute(command, Duration::from_secs(timeout), &[])
                .await
            {
                Ok(outcome) => {
                    let mut combined = outcome.stdout;
                    if !outcome.stderr.is_empty() {
                        if !combined.is_empty() {
                            combined.push('\n');
                        }
                        combined.push_str(&outcome.stderr);
                    }
                    combined.push_str(&format!("\n(exit code: {})", outcome.exit_code));

                    if outcome.exit_code == 0 {
                        Ok(ToolOutput::success(combined))
                    } else {
                        Ok(ToolOutput::error(combined))
                    }
                }
                // Executor failures are command-level, not conversation-level
                Err(e) => Ok(ToolOutput::error(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> ShellTool {
        let executor = Arc::new(SecureExecutor::new(
            "/tmp",
            ["echo", "ls", "pwd", "sleep", "false"]
                .into_iter()
                .map(String::from),
        ));
        let commands = Arc::new(Mutex::new(CommandPolicy::new(
            vec!["ls".into(), "ls *".into(), "echo *".into()],
            vec!["rm *".into()],
        )));
        ShellTool::new(executor, commands, Duration::from_secs(30))
    }

    #[test]
    fn definition_names_shell() {
        assert_eq!(shell().definition().name, "shell");
    }

    #[test]
    fn permission_consults_command_lists() {
        let tool = shell();
        assert_eq!(
            tool.permission(&json!({"command": "ls -la"})),
            ToolPermission::Always
        );
        assert_eq!(
            tool.permission(&json!({"command": "rm -rf /"})),
            ToolPermission::Never
        );
        assert_eq!(
            tool.permission(&json!({"command": "make build"})),
            ToolPermission::Ask
        );
        // Missing command: nothing to vouch for
        assert_eq!(tool.permission(&json!({})), ToolPermission::Ask);
    }

    #[test]
    fn learned_rule_changes_permission() {
        let tool = shell();
        assert_eq!(
            tool.permission(&json!({"command": "make build"})),
            ToolPermission::Ask
        );
        tool.command_policy()
            .lock()
            .unwrap()
            .add_allow_rule("make *");
        assert_eq!(
            tool.permission(&json!({"command": "make build"})),
            ToolPermission::Always
        );
    }

    #[tokio::test]
    async fn executes_and_reports_exit_code() {
        let output = shell().execute(json!({"command": "echo hi"})).await.unwrap();
        assert!(!output.is_error);
        assert!(output.content.contains("hi"));
        assert!(output.content.contains("exit code: 0"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_output() {
        let output = shell().execute(json!({"command": "false"})).await.unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("exit code: 1"));
    }

    #[tokio::test]
    async fn executor_rejection_becomes_error_output() {
        let output = shell()
            .execute(json!({"command": "curl http://example.com"}))
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("allow-list"));
    }

    #[tokio::test]
    async fn timeout_becomes_error_output() {
        let output = shell()
            .execute(json!({"command": "sleep 5", "timeout_seconds": 1}))
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("timed out"), "got: {}", output.content);
    }

    #[tokio::test]
    async fn missing_command_is_an_agent_error() {
        let err = shell().execute(json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Agent(_)));
    }
}
