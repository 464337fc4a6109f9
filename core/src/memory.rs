//! Per-user, per-session bounded conversation history.
//!
//! The whole memory store is one record in the `"memory"` scope, shaped as
//! `user_id -> session_id -> [Turn]`. Appends are whole-store
//! read-modify-write cycles through the record store's single exclusion
//! point, so the granularity of locking is the entire store; concurrent
//! sessions of different users race with last-writer-wins semantics at that
//! granularity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::StorageError;
use crate::store::RecordStore;

const SCOPE: &str = "memory";
const STORE_KEY: &str = "store";

/// Session key used when a caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Upper bound on retained turns per session unless a caller overrides it.
pub const DEFAULT_MAX_TURNS: usize = 20;

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

impl Turn {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ConversationMemory {
    records: Arc<dyn RecordStore>,
}

impl ConversationMemory {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Ordered history for `(user_id, session_id)`. An empty sequence when
    /// nothing was recorded yet, never an error.
    pub fn load_history(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<Turn>, StorageError> {
        let session = session_key(session_id);
        let Some(root) = self.records.read(SCOPE, STORE_KEY)? else {
            return Ok(Vec::new());
        };
        let Some(list) = root.get(user_id).and_then(|u| u.get(session)) else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_value(list.clone())?)
    }

    /// Append one turn, truncate the session to the most recent
    /// `max_length` entries (oldest dropped first), persist the full store
    /// synchronously. Returns the session length after the append.
    pub fn append_entry(
        &self,
        user_id: &str,
        role: &str,
        content: &str,
        session_id: Option<&str>,
        max_length: usize,
    ) -> Result<usize, StorageError> {
        let session = session_key(session_id);
        let turn = json!({ "role": role, "content": content });
        let mut appended_len = 0usize;

        self.records.update(SCOPE, STORE_KEY, &mut |current| {
            let mut root = match current {
                Some(value @ Value::Object(_)) => value,
                // first run, or an unreadable store being re-created
                _ => json!({}),
            };
            if let Some(users) = root.as_object_mut() {
                let user_slot = users
                    .entry(user_id.to_string())
                    .or_insert_with(|| json!({}));
                if !user_slot.is_object() {
                    *user_slot = json!({});
                }
                if let Some(sessions) = user_slot.as_object_mut() {
                    let list = sessions
                        .entry(session.to_string())
                        .or_insert_with(|| json!([]));
                    if !list.is_array() {
                        *list = json!([]);
                    }
                    if let Some(turns) = list.as_array_mut() {
                        turns.push(turn.clone());
                        if turns.len() > max_length {
                            let overflow = turns.len() - max_length;
                            turns.drain(0..overflow);
                        }
                        appended_len = turns.len();
                    }
                }
            }
            root
        })?;

        Ok(appended_len)
    }

    /// Session length without materialising the turns.
    pub fn history_len(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        Ok(self.load_history(user_id, session_id)?.len())
    }

    /// The most recent `n` turns, oldest first. Used for memory snapshots in
    /// API responses.
    pub fn tail(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        n: usize,
    ) -> Result<Vec<Turn>, StorageError> {
        let mut history = self.load_history(user_id, session_id)?;
        let skip = history.len().saturating_sub(n);
        Ok(history.split_off(skip))
    }
}

fn session_key(session_id: Option<&str>) -> &str {
    match session_id {
        Some(s) if !s.is_empty() => s,
        _ => DEFAULT_SESSION,
    }
}
