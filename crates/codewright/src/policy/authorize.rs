use std::sync::{Arc, Mutex};

use crate::policy::mode::ModePolicy;
use crate::policy::permission::ToolPermission;

/// Outcome of authorizing one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Run the tool.
    Execute,
    /// Do not run; the reason becomes the tool-result content so the model
    /// can adapt.
    Skip(String),
    /// Suspend on the approval gate before running.
    AwaitApproval,
}

/// Combines the mode policy, the tool's static permission verdict, and the
/// auto-approve state into one decision.
///
/// This is the only call site that consults the mode policy for a tool
/// invocation, and the read-only block is checked first: an invocation
/// blocked by a read-only mode never executes, even when auto-approve has
/// been forced on elsewhere.
pub struct Authorizer {
    modes: Arc<Mutex<ModePolicy>>,
}

impl Authorizer {
    pub fn new(modes: Arc<Mutex<ModePolicy>>) -> Self {
        Self { modes }
    }

    pub fn modes(&self) -> &Arc<Mutex<ModePolicy>> {
        &self.modes
    }

    pub fn authorize(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        static_permission: ToolPermission,
    ) -> Authorization {
        let modes = self.modes.lock().expect("mode policy lock poisoned");

        // Read-only block first. Nothing below may override it.
        if let Some(reason) = modes.should_block(tool_name, args) {
            return Authorization::Skip(reason);
        }

        match static_permission {
            ToolPermission::Never => Authorization::Skip(format!(
                "'{tool_name}' was denied by the permission list and will not run"
            )),
            ToolPermission::Always => Authorization::Execute,
            ToolPermission::Ask => {
                if modes.should_auto_approve(tool_name) {
                    Authorization::Execute
                } else {
                    Authorization::AwaitApproval
                }
            }
        }
    }
}
