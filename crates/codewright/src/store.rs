use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::llm::types::{Conversation, TokenUsage};
use crate::policy::mode::Mode;

/// Cumulative counters for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub turns: usize,
    pub usage: TokenUsage,
    pub spend_usd: f64,
}

/// Everything needed to resume a session after a crash or restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub conversation: Conversation,
    pub stats: SessionStats,
    pub mode: Mode,
    pub updated_at: DateTime<Utc>,
}

/// Persistence boundary. Invoked after every turn boundary and on
/// cancellation/error for crash-recoverable session logs.
pub trait SessionStore: Send + Sync {
    fn save_interaction(&self, snapshot: &SessionSnapshot) -> Result<(), Error>;
    fn load_session(&self, id: &str) -> Result<SessionSnapshot, Error>;
    fn find_latest_session(&self) -> Result<Option<SessionSnapshot>, Error>;
}

/// One JSON file per session under a directory.
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl SessionStore for JsonSessionStore {
    fn save_interaction(&self, snapshot: &SessionSnapshot) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Store(format!("failed to create {}: {e}", self.dir.display())))?;

        let path = self.path_for(&snapshot.id);
        let content = serde_json::to_string_pretty(snapshot)?;

        // Write-then-rename so a crash mid-write never corrupts the previous
        // snapshot.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::Store(format!("failed to rename {}: {e}", tmp.display())))?;
        Ok(())
    }

    fn load_session(&self, id: &str) -> Result<SessionSnapshot, Error> {
        let path = self.path_for(id);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn find_latest_session(&self) -> Result<Option<SessionSnapshot>, Error> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Store(format!(
                    "failed to list {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut latest: Option<SessionSnapshot> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(snapshot) = serde_json::from_str::<SessionSnapshot>(&content) else {
                tracing::warn!(path = %path.display(), "skipping unreadable session snapshot");
                continue;
            };
            let newer = latest
                .as_ref()
                .map(|l| snapshot.updated_at > l.updated_at)
                .unwrap_or(true);
            if newer {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::Message;

    fn snapshot(id: &str, updated_at: DateTime<Utc>) -> SessionSnapshot {
        let mut conversation = Conversation::new("sys");
        conversation.push(Message::user("hello"));
        SessionSnapshot {
            id: id.into(),
            conversation,
            stats: SessionStats {
                turns: 2,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 40,
                },
                spend_usd: 0.01,
            },
            mode: Mode::Normal,
            updated_at,
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let original = snapshot("session-1", Utc::now());
        store.save_interaction(&original).unwrap();

        let loaded = store.load_session("session-1").unwrap();
        assert_eq!(loaded.id, "session-1");
        assert_eq!(loaded.conversation.len(), 2);
        assert_eq!(loaded.stats.turns, 2);
        assert_eq!(loaded.stats.usage.input_tokens, 100);
        assert_eq!(loaded.mode, Mode::Normal);
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let mut snap = snapshot("session-1", Utc::now());
        store.save_interaction(&snap).unwrap();
        snap.stats.turns = 5;
        store.save_interaction(&snap).unwrap();

        assert_eq!(store.load_session("session-1").unwrap().stats.turns, 5);
    }

    #[test]
    fn load_missing_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());
        assert!(matches!(
            store.load_session("nope"),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn find_latest_picks_newest_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let old = snapshot("old", Utc::now() - chrono::Duration::hours(2));
        let new = snapshot("new", Utc::now());
        store.save_interaction(&old).unwrap();
        store.save_interaction(&new).unwrap();

        let latest = store.find_latest_session().unwrap().unwrap();
        assert_eq!(latest.id, "new");
    }

    #[test]
    fn find_latest_on_empty_or_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().join("never-created"));
        assert!(store.find_latest_session().unwrap().is_none());

        let store = JsonSessionStore::new(dir.path());
        assert!(store.find_latest_session().unwrap().is_none());
    }

    #[test]
    fn find_latest_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        store.save_interaction(&snapshot("good", Utc::now())).unwrap();

        let latest = store.find_latest_session().unwrap().unwrap();
        assert_eq!(latest.id, "good");
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());
        store.save_interaction(&snapshot("s", Utc::now())).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
