use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Typed failures from the command executor. Non-fatal to the conversation:
/// the engine renders them into error-flagged tool results.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("empty command")]
    Empty,

    #[error("unparseable command syntax: {0}")]
    Parse(String),

    #[error("executable '{0}' is not on the allow-list")]
    NotAllowed(String),

    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("cd: {0}")]
    ChangeDir(String),
}

/// Captured output of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Per-session executor state. Mutated only by the `cd` emulation; child
/// processes cannot change it.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub cwd: PathBuf,
}

/// Shell built-ins that need real shell semantics and therefore run through
/// a `bash -c` invocation. `cd` is not among them: it is emulated entirely
/// inside [`ExecutionState`].
const SHELL_BUILTINS: &[&str] = &["set", "export", "ulimit", "umask", "type", "alias"];

/// Environment variables inherited from the parent process. Everything else
/// (provider API keys included) is withheld from children.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TERM"];

/// Non-interactive defaults always set for children.
const ENV_DEFAULTS: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("PAGER", "cat"),
    ("GIT_PAGER", "cat"),
    ("NO_COLOR", "1"),
];

/// Validates and runs a single shell-like command under a restricted
/// environment.
///
/// Allow-listed executables run in argument-vector form (no shell between
/// the arguments and the kernel, so no shell-level reinterpretation);
/// recognized shell built-ins run through `bash -c`. The working directory
/// persists across calls via the emulated `cd`.
pub struct SecureExecutor {
    state: Mutex<ExecutionState>,
    allowed: HashSet<String>,
}

impl SecureExecutor {
    pub fn new(cwd: impl Into<PathBuf>, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: Mutex::new(ExecutionState { cwd: cwd.into() }),
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn cwd(&self) -> PathBuf {
        self.state.lock().expect("executor state lock poisoned").cwd.clone()
    }

    pub async fn execute(
        &self,
        command_text: &str,
        timeout: Duration,
        extra_env: &[(String, String)],
    ) -> Result<ExecOutcome, ExecError> {
        if command_text.trim().is_empty() {
            return Err(ExecError::Empty);
        }

        let argv = shlex::split(command_text)
            .ok_or_else(|| ExecError::Parse("unbalanced quotes or trailing escape".into()))?;
        let Some(program) = argv.first() else {
            return Err(ExecError::Empty);
        };

        if program == "cd" {
            return self.change_directory(&argv);
        }

        let base_name = program.rsplit('/').next().unwrap_or(program);
        let cwd = self.cwd();

        let mut command = if SHELL_BUILTINS.contains(&base_name) {
            let mut command = tokio::process::Command::new("bash");
            command.arg("-c").arg(command_text);
            command
        } else if self.allowed.contains(program) || self.allowed.contains(base_name) {
            let mut command = tokio::process::Command::new(program);
            command.args(&argv[1..]);
            command
        } else {
            return Err(ExecError::NotAllowed(program.clone()));
        };

        command
            .current_dir(&cwd)
            .env_clear()
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in ENV_DEFAULTS {
            command.env(key, value);
        }
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let child = command
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecError::Spawn(e.to_string())),
            Err(_) => {
                // kill_on_drop terminated the process when `child` was
                // dropped by the expired timeout future.
                return Err(ExecError::Timeout(timeout));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(command = command_text, exit_code, "command finished");

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }

    /// `cd` never spawns a process: the target is resolved against the
    /// tracked state and persists only there.
    fn change_directory(&self, argv: &[String]) -> Result<ExecOutcome, ExecError> {
        let target = argv
            .get(1)
            .ok_or_else(|| ExecError::ChangeDir("missing target directory".into()))?;
        if argv.len() > 2 {
            return Err(ExecError::ChangeDir("too many arguments".into()));
        }

        let mut state = self.state.lock().expect("executor state lock poisoned");
        let candidate = if PathBuf::from(target).is_absolute() {
            PathBuf::from(target)
        } else {
            state.cwd.join(target)
        };

        let resolved = candidate
            .canonicalize()
            .map_err(|e| ExecError::ChangeDir(format!("{}: {e}", candidate.display())))?;
        if !resolved.is_dir() {
            return Err(ExecError::ChangeDir(format!(
                "{}: not a directory",
                resolved.display()
            )));
        }

        state.cwd = resolved;
        Ok(ExecOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_in(dir: &std::path::Path) -> SecureExecutor {
        SecureExecutor::new(
            dir,
            ["echo", "cat", "ls", "pwd", "env", "sleep", "sh", "true", "false"]
                .into_iter()
                .map(String::from),
        )
    }

    fn executor() -> SecureExecutor {
        executor_in(std::path::Path::new("/tmp"))
    }

    #[tokio::test]
    async fn echo_captures_stdout() {
        let outcome = executor()
            .execute("echo hello", Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_code_reported() {
        let outcome = executor()
            .execute("false", Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let outcome = executor()
            .execute("sh -c 'echo out; echo err >&2'", Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn empty_command_is_typed_error() {
        assert!(matches!(
            executor().execute("", Duration::from_secs(1), &[]).await,
            Err(ExecError::Empty)
        ));
        assert!(matches!(
            executor().execute("   ", Duration::from_secs(1), &[]).await,
            Err(ExecError::Empty)
        ));
    }

    #[tokio::test]
    async fn unbalanced_quotes_are_parse_error() {
        assert!(matches!(
            executor()
                .execute("echo 'unterminated", Duration::from_secs(1), &[])
                .await,
            Err(ExecError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn disallowed_executable_rejected() {
        let err = executor()
            .execute("curl http://example.com", Duration::from_secs(1), &[])
            .await
            .unwrap_err();
        match err {
            ExecError::NotAllowed(program) => assert_eq!(program, "curl"),
            other => panic!("expected NotAllowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn path_qualified_allowed_program_runs() {
        let outcome = executor()
            .execute("/bin/echo qualified", Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "qualified");
    }

    #[tokio::test]
    async fn timeout_kills_and_errors() {
        let err = executor()
            .execute("sleep 10", Duration::from_millis(200), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn cd_is_emulated_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let exec = executor_in(dir.path());
        let outcome = exec.execute("cd sub", Duration::from_secs(1), &[]).await.unwrap();
        assert_eq!(outcome.exit_code, 0);

        let outcome = exec.execute("pwd", Duration::from_secs(5), &[]).await.unwrap();
        assert_eq!(
            PathBuf::from(outcome.stdout.trim()),
            sub.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn cd_to_missing_directory_errors_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor_in(dir.path());
        let before = exec.cwd();

        assert!(matches!(
            exec.execute("cd does-not-exist", Duration::from_secs(1), &[]).await,
            Err(ExecError::ChangeDir(_))
        ));
        assert_eq!(exec.cwd(), before);
    }

    #[tokio::test]
    async fn cd_requires_exactly_one_argument() {
        let exec = executor();
        assert!(matches!(
            exec.execute("cd", Duration::from_secs(1), &[]).await,
            Err(ExecError::ChangeDir(_))
        ));
        assert!(matches!(
            exec.execute("cd a b", Duration::from_secs(1), &[]).await,
            Err(ExecError::ChangeDir(_))
        ));
    }

    #[tokio::test]
    async fn environment_is_minimal() {
        let outcome = executor()
            .execute("env", Duration::from_secs(5), &[])
            .await
            .unwrap();

        let expected: HashSet<&str> = ENV_ALLOWLIST
            .iter()
            .copied()
            .chain(ENV_DEFAULTS.iter().map(|(k, _)| *k))
            .chain(["PWD", "SHLVL", "_"]) // set by env/sh themselves
            .collect();

        for line in outcome.stdout.lines() {
            let Some((key, _)) = line.split_once('=') else {
                continue;
            };
            assert!(
                expected.contains(key),
                "unexpected environment variable forwarded to child: {key}"
            );
        }
    }

    #[tokio::test]
    async fn extra_env_is_forwarded() {
        let outcome = executor()
            .execute(
                "env",
                Duration::from_secs(5),
                &[("BUILD_TAG".into(), "abc123".into())],
            )
            .await
            .unwrap();
        assert!(outcome.stdout.contains("BUILD_TAG=abc123"));
    }

    #[tokio::test]
    async fn secure_defaults_present() {
        let outcome = executor()
            .execute("env", Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert!(outcome.stdout.contains("GIT_TERMINAL_PROMPT=0"));
        assert!(outcome.stdout.contains("PAGER=cat"));
    }

    #[tokio::test]
    async fn argv_form_does_not_reinterpret_metacharacters() {
        // Run directly (no shell), so ';' is a literal argument
        let outcome = executor()
            .execute("echo a;b", Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "a;b");
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_replaced_not_fatal() {
        // \377 and \376 are lone bytes that are invalid UTF-8
        let outcome = executor()
            .execute(r#"sh -c 'printf "\377\376ok"'"#, Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert!(outcome.stdout.contains("ok"));
        assert!(outcome.stdout.contains('\u{FFFD}'));
    }
}
