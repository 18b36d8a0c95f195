// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, warn};

use ollm_model::Message;

use crate::session::{SessionRecord, SessionSummary, ToolCallRecord};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session io: {0}")]
    Io(#[from] std::io::Error),
    /// The file exists but does not parse; it has been quarantined with a
    /// `.corrupt` suffix so a fresh session can take its place.
    #[error("session file corrupt: {}", path.display())]
    Corrupt { path: PathBuf },
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session locked by another process: {0}")]
    Locked(String),
}

/// On-disk store: one JSON file per session under the data directory.
///
/// Writes go through a sibling temp file, fsync, and rename, then the
/// directory itself is fsynced — a reader sees either the previous complete
/// file or the new complete file, never a partial one.  An advisory lock per
/// session prevents two processes from writing the same file.
pub struct SessionStore {
    dir: PathBuf,
    sessions: HashMap<String, SessionRecord>,
    dirty: HashSet<String>,
    /// Held advisory locks; dropping the file handle releases the lock.
    locks: HashMap<String, File>,
}

impl SessionStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sessions: HashMap::new(),
            dirty: HashSet::new(),
            locks: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Create a new session, lock it, and durably write its initial file.
    pub fn create(
        &mut self,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Result<String, SessionError> {
        let record = SessionRecord::new(model, provider);
        let id = record.session_id.clone();
        self.acquire_lock(&id)?;
        self.sessions.insert(id.clone(), record);
        self.dirty.insert(id.clone());
        self.flush(&id)?;
        debug!(session_id = %id, "created session");
        Ok(id)
    }

    fn acquire_lock(&mut self, id: &str) -> Result<(), SessionError> {
        if self.locks.contains_key(id) {
            return Ok(());
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(id))?;
        match lock_file.try_lock_exclusive() {
            Ok(true) => {
                self.locks.insert(id.to_string(), lock_file);
                Ok(())
            }
            Ok(false) => Err(SessionError::Locked(id.to_string())),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    /// Append a message to the in-memory session and schedule a flush.
    pub fn append_message(&mut self, id: &str, msg: Message) -> Result<(), SessionError> {
        let record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        record.push_message(msg);
        self.dirty.insert(id.to_string());
        Ok(())
    }

    pub fn append_tool_call(
        &mut self,
        id: &str,
        call: ToolCallRecord,
    ) -> Result<(), SessionError> {
        let record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        record.push_tool_call(call);
        self.dirty.insert(id.to_string());
        Ok(())
    }

    /// Update the cumulative counters.
    pub fn set_metadata(
        &mut self,
        id: &str,
        token_count: u64,
        compression_count: u32,
    ) -> Result<(), SessionError> {
        let record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        record.metadata.token_count = token_count;
        record.metadata.compression_count = compression_count;
        self.dirty.insert(id.to_string());
        Ok(())
    }

    /// Replace the message sequence wholesale (snapshot restore).
    pub fn replace_messages(
        &mut self,
        id: &str,
        messages: Vec<Message>,
    ) -> Result<(), SessionError> {
        let record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        record.messages = messages;
        self.dirty.insert(id.to_string());
        Ok(())
    }

    /// Durably persist the session if it has unflushed changes.
    ///
    /// On failure the in-memory session stays authoritative and dirty, so
    /// the next flush retries.
    pub fn flush(&mut self, id: &str) -> Result<(), SessionError> {
        if !self.dirty.contains(id) {
            return Ok(());
        }
        let record = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        atomic_write(&self.dir, &self.session_path(id), &bytes)?;
        self.dirty.remove(id);
        Ok(())
    }

    /// Load a session from disk, acquire its lock, and make it current.
    ///
    /// A file that fails to parse is renamed with a `.corrupt` suffix and
    /// reported; the caller may then start a fresh session.
    pub fn load(&mut self, id: &str) -> Result<&SessionRecord, SessionError> {
        let path = self.session_path(id);
        if !path.is_file() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let text = fs::read_to_string(&path)?;
        let record: SessionRecord = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let quarantine = path.with_extension("json.corrupt");
                warn!(
                    path = %path.display(),
                    error = %e,
                    "session file corrupt; quarantining"
                );
                fs::rename(&path, &quarantine)?;
                return Err(SessionError::Corrupt { path: quarantine });
            }
        };
        self.acquire_lock(id)?;
        self.sessions.insert(id.to_string(), record);
        self.dirty.remove(id);
        Ok(&self.sessions[id])
    }

    /// Enumerate sessions on disk, newest first.  Unparseable files are
    /// skipped with a warning; they never fail the listing.
    pub fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                    continue;
                }
            };
            match serde_json::from_str::<SessionRecord>(&text) {
                Ok(record) => summaries.push(record.summary()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt session file");
                }
            }
        }
        summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(summaries)
    }

    /// Remove a session file.  Deleting a session that does not exist is an
    /// error, never silent.
    pub fn delete(&mut self, id: &str) -> Result<(), SessionError> {
        let path = self.session_path(id);
        if !path.is_file() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        fs::remove_file(&path)?;
        let _ = fs::remove_file(self.lock_path(id));
        self.sessions.remove(id);
        self.dirty.remove(id);
        self.locks.remove(id);
        debug!(session_id = %id, "deleted session");
        Ok(())
    }

    /// Delete the oldest sessions (by start time) until at most `max_count`
    /// remain.  Returns how many were removed.
    pub fn enforce_retention(&mut self, max_count: usize) -> Result<usize, SessionError> {
        let mut summaries = self.list()?;
        if summaries.len() <= max_count {
            return Ok(0);
        }
        // list() is newest-first; everything past `max_count` goes.
        let doomed: Vec<String> = summaries.split_off(max_count).into_iter().map(|s| s.id).collect();
        let mut removed = 0;
        for id in doomed {
            match self.delete(&id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(session_id = %id, error = %e, "retention delete failed"),
            }
        }
        Ok(removed)
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target, fsync the directory.
fn atomic_write(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SessionError::Io(e.error))?;
    // Make the rename itself durable.
    File::open(dir)?.sync_all()?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use ollm_model::{Message, Part, Role};
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;
    use crate::session::{CallStatus, ToolCallResult};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    // ── Create / flush / load ─────────────────────────────────────────────────

    #[test]
    fn create_writes_a_parsable_file() {
        let (_dir, mut store) = store();
        let id = store.create("llama3.2", "ollama").unwrap();
        let path = store.session_path(&id);
        assert!(path.is_file());
        let text = fs::read_to_string(&path).unwrap();
        let record: SessionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(record.session_id, id);
        assert_eq!(record.model, "llama3.2");
    }

    #[test]
    fn flush_then_load_round_trips() {
        let (dir, mut store) = store();
        let id = store.create("m", "p").unwrap();
        store.append_message(&id, Message::system("sys")).unwrap();
        store.append_message(&id, Message::user("hello")).unwrap();
        store.flush(&id).unwrap();
        let original = store.get(&id).unwrap().clone();

        // A brand-new store simulates a fresh process.
        let mut store2 = SessionStore::open(dir.path()).unwrap();
        // The original store still holds the advisory lock.
        drop(store);
        let loaded = store2.load(&id).unwrap();
        assert_eq!(*loaded, original);
    }

    #[test]
    fn unflushed_appends_are_not_visible_on_disk() {
        let (_dir, mut store) = store();
        let id = store.create("m", "p").unwrap();
        store.append_message(&id, Message::user("volatile")).unwrap();
        let text = fs::read_to_string(store.session_path(&id)).unwrap();
        let on_disk: SessionRecord = serde_json::from_str(&text).unwrap();
        assert!(on_disk.messages.is_empty(), "append must not write until flush");
    }

    #[test]
    fn load_missing_session_is_not_found() {
        let (_dir, mut store) = store();
        let err = store.load("no-such-id").unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn corrupt_file_is_quarantined_and_reported() {
        let (_dir, mut store) = store();
        let id = "4aa2f2e9-0000-0000-0000-000000000000";
        fs::write(store.session_path(id), "{ not json").unwrap();
        let err = store.load(id).unwrap_err();
        assert!(matches!(err, SessionError::Corrupt { .. }));
        assert!(!store.session_path(id).exists(), "original must be renamed");
        assert!(
            store.session_path(id).with_extension("json.corrupt").exists(),
            "quarantined copy must exist"
        );
    }

    #[test]
    fn delete_removes_the_file() {
        let (_dir, mut store) = store();
        let id = store.create("m", "p").unwrap();
        store.delete(&id).unwrap();
        assert!(!store.session_path(&id).exists());
    }

    #[test]
    fn delete_missing_session_is_an_error() {
        let (_dir, mut store) = store();
        let err = store.delete("ghost").unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn second_process_cannot_lock_a_held_session() {
        let (dir, mut store) = store();
        let id = store.create("m", "p").unwrap();
        let mut store2 = SessionStore::open(dir.path()).unwrap();
        let err = store2.load(&id).unwrap_err();
        assert!(matches!(err, SessionError::Locked(_)), "got {err:?}");
    }

    // ── Listing and retention ─────────────────────────────────────────────────

    #[test]
    fn list_returns_all_sessions_newest_first() {
        let (_dir, mut store) = store();
        let a = store.create("m", "p").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = store.create("m", "p").unwrap();
        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, b, "newest first");
        assert_eq!(list[1].id, a);
    }

    #[test]
    fn list_skips_corrupt_files() {
        let (_dir, mut store) = store();
        store.create("m", "p").unwrap();
        fs::write(store.dir().join("broken.json"), "garbage").unwrap();
        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn retention_keeps_the_newest_sessions() {
        let (_dir, mut store) = store();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create("m", "p").unwrap());
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let removed = store.enforce_retention(2).unwrap();
        assert_eq!(removed, 3);
        let kept: Vec<String> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(&ids[4]));
        assert!(kept.contains(&ids[3]));
    }

    #[test]
    fn retention_noop_when_under_limit() {
        let (_dir, mut store) = store();
        store.create("m", "p").unwrap();
        assert_eq!(store.enforce_retention(10).unwrap(), 0);
    }

    // ── Property tests ────────────────────────────────────────────────────────

    fn arb_message() -> impl Strategy<Value = Message> {
        let role = prop_oneof![
            Just(Role::System),
            Just(Role::User),
            Just(Role::Assistant),
            Just(Role::Tool),
        ];
        let part = prop_oneof![
            "[ -~]{0,64}".prop_map(|text| Part::Text { text }),
            ("[A-Za-z0-9+/=]{4,32}", "image/(png|jpeg)").prop_map(|(data, mime)| Part::Image {
                data,
                mime
            }),
            ("call_[0-9]{1,4}", "[ -~]{0,64}").prop_map(|(tool_call_id, content)| {
                Part::ToolResult {
                    tool_call_id,
                    content,
                }
            }),
        ];
        (role, proptest::collection::vec(part, 1..4)).prop_map(|(role, parts)| Message {
            role,
            parts,
            timestamp: Utc::now(),
        })
    }

    fn arb_tool_call() -> impl Strategy<Value = ToolCallRecord> {
        (
            "call_[0-9]{1,4}",
            "[a-z_]{1,12}",
            "[ -~]{0,64}",
            proptest::bool::ANY,
        )
            .prop_map(|(id, name, content, ok)| ToolCallRecord {
                id,
                name,
                args: serde_json::json!({ "value": content }),
                result: ToolCallResult {
                    llm_content: content,
                    return_display: None,
                },
                status: if ok { CallStatus::Ok } else { CallStatus::Error },
                timestamp: Utc::now(),
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// `load(save(s)) ≡ s` for any session content.
        #[test]
        fn save_load_round_trip(
            messages in proptest::collection::vec(arb_message(), 0..12),
            calls in proptest::collection::vec(arb_tool_call(), 0..6),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut store = SessionStore::open(dir.path()).unwrap();
            let id = store.create("model-x", "provider-y").unwrap();
            for m in messages {
                store.append_message(&id, m).unwrap();
            }
            for c in calls {
                store.append_tool_call(&id, c).unwrap();
            }
            store.flush(&id).unwrap();
            let original = store.get(&id).unwrap().clone();
            drop(store);

            let mut store2 = SessionStore::open(dir.path()).unwrap();
            let loaded = store2.load(&id).unwrap();
            prop_assert_eq!(loaded, &original);
        }

        /// Every written file parses, has the contract fields, valid
        /// timestamps, and a UUID session id.
        #[test]
        fn written_files_are_valid(
            messages in proptest::collection::vec(arb_message(), 0..8),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut store = SessionStore::open(dir.path()).unwrap();
            let id = store.create("m", "p").unwrap();
            for m in messages {
                store.append_message(&id, m).unwrap();
            }
            store.flush(&id).unwrap();

            let text = fs::read_to_string(dir.path().join(format!("{id}.json"))).unwrap();
            let v: serde_json::Value = serde_json::from_str(&text).unwrap();
            for field in ["sessionId", "startTime", "lastActivity", "model", "provider",
                          "messages", "toolCalls", "metadata"] {
                prop_assert!(v.get(field).is_some(), "missing field {}", field);
            }
            prop_assert!(Uuid::parse_str(v["sessionId"].as_str().unwrap()).is_ok());
            for field in ["startTime", "lastActivity"] {
                let ts = v[field].as_str().unwrap();
                prop_assert!(ts.parse::<DateTime<Utc>>().is_ok(), "bad timestamp {}", ts);
            }
        }

        /// After `enforce_retention(n)` at most n sessions remain, and they
        /// are exactly the newest by start time.
        #[test]
        fn retention_bound_holds(extra in 0usize..6, keep in 1usize..4) {
            let dir = tempfile::tempdir().unwrap();
            let mut store = SessionStore::open(dir.path()).unwrap();
            let mut ids = Vec::new();
            for _ in 0..(keep + extra) {
                ids.push(store.create("m", "p").unwrap());
                std::thread::sleep(std::time::Duration::from_millis(2));
            }
            store.enforce_retention(keep).unwrap();
            let left = store.list().unwrap();
            prop_assert!(left.len() <= keep);
            let expected: HashSet<String> =
                ids.iter().rev().take(keep).cloned().collect();
            let actual: HashSet<String> = left.into_iter().map(|s| s.id).collect();
            prop_assert_eq!(actual, expected);
        }

        /// Appending never moves `last_activity` backwards.
        #[test]
        fn last_activity_is_monotone(
            messages in proptest::collection::vec(arb_message(), 1..10),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut store = SessionStore::open(dir.path()).unwrap();
            let id = store.create("m", "p").unwrap();
            let mut previous = store.get(&id).unwrap().last_activity;
            for m in messages {
                store.append_message(&id, m).unwrap();
                let now = store.get(&id).unwrap().last_activity;
                prop_assert!(now >= previous);
                previous = now;
            }
        }
    }
}
