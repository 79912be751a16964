use serde::{Deserialize, Serialize};

/// Static allow/deny/ask verdict for one command string, independent of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPermission {
    /// Execute without asking.
    Always,
    /// Reject without asking.
    Never,
    /// Defer to auto-approve state or the approval gate.
    Ask,
}

/// Allow/deny glob lists evaluated against command strings.
///
/// Deny always wins over allow. Commands containing shell chaining or piping
/// are split on operator boundaries and each segment must independently pass
/// both lists for the aggregate to resolve to `Always`; a single segment
/// matching the deny list forces `Never` for the whole command. Command
/// substitution cannot be vouched for segment-by-segment and therefore never
/// resolves to `Always`.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl CommandPolicy {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    /// Append an allow pattern learned from an "always" approval verdict.
    /// Deny rules keep priority regardless of insertion order.
    pub fn add_allow_rule(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !self.allow.contains(&pattern) {
            self.allow.push(pattern);
        }
    }

    pub fn evaluate(&self, command: &str) -> ToolPermission {
        let command = command.trim();
        if command.is_empty() {
            return ToolPermission::Ask;
        }

        if has_substitution(command) {
            // Substituted text executes whatever it expands to, so the
            // allow list cannot vouch for it. Deny matching still applies.
            if self.matches_deny(command) {
                return ToolPermission::Never;
            }
            return ToolPermission::Ask;
        }

        let segments: Vec<&str> = split_segments(command)
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if segments.is_empty() {
            return ToolPermission::Ask;
        }

        if segments.iter().any(|s| self.matches_deny(s)) {
            return ToolPermission::Never;
        }

        if segments.iter().all(|s| self.matches_allow(s)) {
            return ToolPermission::Always;
        }

        ToolPermission::Ask
    }

    fn matches_allow(&self, text: &str) -> bool {
        self.allow.iter().any(|p| glob_match(p, text))
    }

    fn matches_deny(&self, text: &str) -> bool {
        self.deny.iter().any(|p| glob_match(p, text))
    }
}

/// Split a command string on shell chaining/piping operators
/// (`;`, `&&`, `||`, `|`, `&`, newline). Operator tokens themselves are
/// dropped; empty segments remain for the caller to filter.
pub fn split_segments(command: &str) -> Vec<&str> {
    command
        .split(|c| c == ';' || c == '|' || c == '&' || c == '\n')
        .collect()
}

/// Detect command substitution (backticks or `$(...)`).
fn has_substitution(command: &str) -> bool {
    command.contains('`') || command.contains("$(")
}

/// Simple glob matching: `*` matches zero or more of any character,
/// `?` matches exactly one character. All other characters match literally.
///
/// Uses an iterative two-pointer approach (O(n*m) worst case) to avoid
/// exponential blowup from recursive backtracking on pathological patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // Position of the last '*' in pattern, and the text position to retry from.
    let (mut star_pi, mut star_ti) = (usize::MAX, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_pi = pi;
            star_ti = ti;
            pi += 1;
        } else if star_pi != usize::MAX {
            // Backtrack: advance the star's text match by one
            pi = star_pi + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    // Consume trailing '*'s in pattern
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }

    pi == p.len()
}
