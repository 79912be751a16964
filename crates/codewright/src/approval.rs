use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Verdict returned through the approval channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalVerdict {
    Yes,
    No,
    /// Approve and remember: the caller should record an allow rule so the
    /// same invocation no longer asks.
    Always,
}

/// A completed approval with an optional human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: ApprovalVerdict,
    pub message: Option<String>,
}

impl Resolution {
    fn no(message: impl Into<String>) -> Self {
        Self {
            verdict: ApprovalVerdict::No,
            message: Some(message.into()),
        }
    }
}

/// Callback invoked when a tool invocation needs confirmation. The external
/// channel (UI, bot, REPL) presents it and later calls [`ApprovalGate::resolve`].
pub type OnApprovalRequest = dyn Fn(&str, &serde_json::Value, &str) + Send + Sync;

struct Pending {
    tx: oneshot::Sender<Resolution>,
    tool_name: String,
    created_at: Instant,
}

/// Correlation-table-based suspend/resume mechanism between the turn engine
/// and an external confirmation channel.
///
/// Each pending approval holds a oneshot sender, written exactly once by
/// `resolve`; the waiting turn holds the receiver. Resolving an unknown or
/// already-resolved correlation id is a no-op.
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, Pending>>,
    on_request: Option<Arc<OnApprovalRequest>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            on_request: None,
        }
    }

    pub fn with_notifier(on_request: Arc<OnApprovalRequest>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            on_request: Some(on_request),
        }
    }

    /// Register a pending approval and notify the external channel. The
    /// returned receiver completes when `resolve` (or expiry/cancellation)
    /// supplies a verdict.
    pub fn request_approval(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        correlation_id: &str,
    ) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        let previous = {
            let mut pending = self.pending.lock().expect("approval table lock poisoned");
            pending.insert(
                correlation_id.to_string(),
                Pending {
                    tx,
                    tool_name: tool_name.to_string(),
                    created_at: Instant::now(),
                },
            )
        };
        if let Some(previous) = previous {
            warn!(
                correlation_id,
                tool = previous.tool_name,
                "replaced an unresolved approval with the same correlation id"
            );
            let _ = previous.tx.send(Resolution::no("superseded by a newer request"));
        }

        if let Some(cb) = &self.on_request {
            cb(tool_name, args, correlation_id);
        }

        rx
    }

    /// Complete exactly one waiting request. Returns `true` if a pending
    /// entry was resolved; unknown or already-resolved ids return `false`
    /// without error.
    pub fn resolve(
        &self,
        correlation_id: &str,
        verdict: ApprovalVerdict,
        message: Option<String>,
    ) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("approval table lock poisoned");
            pending.remove(correlation_id)
        };
        match entry {
            Some(entry) => {
                // The waiter may have given up; a dropped receiver is fine.
                let _ = entry.tx.send(Resolution { verdict, message });
                true
            }
            None => {
                debug!(correlation_id, "resolve for unknown or already-resolved approval");
                false
            }
        }
    }

    /// Garbage-collect entries older than `ttl`, resolving each as an
    /// implicit NO with an expiry reason. Returns how many expired.
    pub fn expire_older_than(&self, ttl: Duration) -> usize {
        let expired: Vec<(String, Pending)> = {
            let mut pending = self.pending.lock().expect("approval table lock poisoned");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.created_at.elapsed() >= ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            debug!(correlation_id = %id, tool = %entry.tool_name, "approval expired");
            let _ = entry.tx.send(Resolution::no("approval request expired"));
        }
        count
    }

    /// Resolve every pending approval as NO. Used on cancellation so no
    /// correlation is left permanently unresolved.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("approval table lock poisoned");
            pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Resolution::no(reason));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("approval table lock poisoned").len()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}
