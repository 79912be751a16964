use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::policy::permission::ToolPermission;
use crate::tool::{Tool, ToolOutput};

const MAX_READ_BYTES: usize = 200 * 1024;

/// Path resolution shared by the file tools: relative paths resolve against
/// the workspace root, and the result must stay inside it.
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let root = root
            .canonicalize()
            .map_err(|e| Error::Config(format!("invalid workspace root {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn resolve_existing(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = self.candidate(path)?;
        let resolved = candidate
            .canonicalize()
            .map_err(|e| format!("failed to resolve {}: {e}", candidate.display()))?;
        self.ensure_inside(&resolved)?;
        Ok(resolved)
    }

    fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = self.candidate(path)?;
        // The file may not exist yet; anchor on the nearest existing ancestor
        let parent = candidate
            .parent()
            .ok_or_else(|| format!("{} has no parent directory", candidate.display()))?;
        let mut anchor = parent;
        let anchor = loop {
            if anchor.exists() {
                break anchor
                    .canonicalize()
                    .map_err(|e| format!("failed to resolve {}: {e}", anchor.display()))?;
            }
            anchor = match anchor.parent() {
                Some(parent) => parent,
                None => return Err(format!("no existing ancestor for {}", candidate.display())),
            };
        };
        self.ensure_inside(&anchor)?;
        Ok(candidate)
    }

    fn candidate(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("path must not be empty".into());
        }
        let path = Path::new(path);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }

    fn ensure_inside(&self, resolved: &Path) -> Result<(), String> {
        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            Err(format!("path escapes workspace root: {}", resolved.display()))
        }
    }
}

/// Build the standard file tool set for a workspace root.
pub fn file_tools(root: impl Into<PathBuf>) -> Result<Vec<Arc<dyn Tool>>, Error> {
    let workspace = Workspace::new(root)?;
    Ok(vec![
        Arc::new(ReadFileTool {
            workspace: workspace.clone(),
        }),
        Arc::new(WriteFileTool {
            workspace: workspace.clone(),
        }),
        Arc::new(EditFileTool {
            workspace: workspace.clone(),
        }),
        Arc::new(ListDirTool { workspace }),
    ])
}

pub struct ReadFileTool {
    pub(crate) workspace: Workspace,
}

impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a UTF-8 text file from the workspace.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the workspace root"}
                },
                "required": ["path"]
            }),
        }
    }

    fn permission(&self, _input: &serde_json::Value) -> ToolPermission {
        ToolPermission::Always
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_path(&input)?;
            let resolved = match self.workspace.resolve_existing(path) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutput::error(e)),
            };

            let bytes = match std::fs::read(&resolved) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "failed to read {}: {e}",
                        resolved.display()
                    )));
                }
            };
            if bytes.len() > MAX_READ_BYTES {
                return Ok(ToolOutput::error(format!(
                    "file is {} bytes, over the {MAX_READ_BYTES} byte read limit",
                    bytes.len()
                )));
            }
            match String::from_utf8(bytes) {
                Ok(content) => Ok(ToolOutput::success(content)),
                Err(_) => Ok(ToolOutput::error("file is not valid UTF-8 text")),
            }
        })
    }
}

pub struct WriteFileTool {
    pub(crate) workspace: Workspace,
}

impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".into(),
            description: "Create or overwrite a file in the workspace.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_path(&input)?;
            let content = input
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("content is required".into()))?;

            let resolved = match self.workspace.resolve_for_write(path) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutput::error(e)),
            };

            if let Some(parent) = resolved.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                return Ok(ToolOutput::error(format!(
                    "failed to create {}: {e}",
                    parent.display()
                )));
            }
            match std::fs::write(&resolved, content) {
                Ok(()) => Ok(ToolOutput::success(format!("wrote {}", resolved.display()))),
                Err(e) => Ok(ToolOutput::error(format!(
                    "failed to write {}: {e}",
                    resolved.display()
                ))),
            }
        })
    }
}

pub struct EditFileTool {
    pub(crate) workspace: Workspace,
}

impl Tool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "edit_file".into(),
            description: "Replace exactly one occurrence of old_text with new_text.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_path(&input)?;
            let old_text = input
                .get("old_text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("old_text is required".into()))?;
            let new_text = input
                .get("new_text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("new_text is required".into()))?;

            if old_text.is_empty() {
                return Ok(ToolOutput::error("old_text must not be empty"));
            }

            let resolved = match self.workspace.resolve_existing(path) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutput::error(e)),
            };
            let current = match std::fs::read_to_string(&resolved) {
                Ok(content) => content,
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "failed to read {}: {e}",
                        resolved.display()
                    )));
                }
            };

            let occurrences = current.match_indices(old_text).count();
            if occurrences != 1 {
                return Ok(ToolOutput::error(format!(
                    "edit_file requires exactly one match; found {occurrences}"
                )));
            }

            let updated = current.replacen(old_text, new_text, 1);
            match std::fs::write(&resolved, updated) {
                Ok(()) => Ok(ToolOutput::success(format!("updated {}", resolved.display()))),
                Err(e) => Ok(ToolOutput::error(format!(
                    "failed to write {}: {e}",
                    resolved.display()
                ))),
            }
        })
    }
}

pub struct ListDirTool {
    pub(crate) workspace: Workspace,
}

impl Tool for ListDirTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_dir".into(),
            description: "List directory entries, directories suffixed with '/'.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory path, '.' for the root"}
                },
                "required": ["path"]
            }),
        }
    }

    fn permission(&self, _input: &serde_json::Value) -> ToolPermission {
        ToolPermission::Always
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_path(&input)?;
            let resolved = match self.workspace.resolve_existing(path) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutput::error(e)),
            };

            let entries = match std::fs::read_dir(&resolved) {
                Ok(entries) => entries,
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "failed to list {}: {e}",
                        resolved.display()
                    )));
                }
            };

            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.path().is_dir() {
                        name.push('/');
                    }
                    name
                })
                .collect();
            names.sort();
            Ok(ToolOutput::success(names.join("\n")))
        })
    }
}

fn require_path(input: &serde_json::Value) -> Result<&str, Error> {
    input
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Agent("path is required".into()))
}
