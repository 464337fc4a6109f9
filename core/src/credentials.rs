//! Per-user, per-provider API key persistence.
//!
//! One record per user in the `"credentials"` scope, holding a map of
//! `provider_id -> base64(secret)`. The base64 transform keeps raw keys out
//! of casual `sqlite3` output; at-rest encryption proper is owned by the
//! external vault collaborator. Secrets are never echoed back in full in any
//! diagnostic output, only presence booleans.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use serde_json::{json, Map, Value};

use crate::errors::StorageError;
use crate::store::RecordStore;

const SCOPE: &str = "credentials";

/// Write-through store with an explicit per-user read cache.
///
/// A user's decoded key map is loaded on first access and reused until a
/// `set` for that user invalidates it.
#[derive(Clone)]
pub struct CredentialStore {
    records: Arc<dyn RecordStore>,
    cache: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl CredentialStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Store (or overwrite) the secret for `(user_id, provider_id)` and
    /// persist synchronously. An empty secret removes the entry. Last write
    /// wins.
    pub fn set(&self, user_id: &str, provider_id: &str, secret: &str) -> Result<(), StorageError> {
        let trimmed = secret.trim();
        let encoded = if trimmed.is_empty() {
            None
        } else {
            Some(B64_ENGINE.encode(trimmed.as_bytes()))
        };

        self.records.update(SCOPE, user_id, &mut |current| {
            let mut keys = current
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_else(Map::new);
            match &encoded {
                Some(value) => {
                    keys.insert(provider_id.to_string(), json!(value));
                }
                None => {
                    keys.remove(provider_id);
                }
            }
            Value::Object(keys)
        })?;

        let mut cache = self.lock_cache();
        cache.remove(user_id);
        Ok(())
    }

    /// Fetch the secret for `(user_id, provider_id)`. Absence means "not
    /// configured yet" and is a normal state.
    pub fn get(&self, user_id: &str, provider_id: &str) -> Result<Option<String>, StorageError> {
        {
            let cache = self.lock_cache();
            if let Some(keys) = cache.get(user_id) {
                return Ok(keys.get(provider_id).cloned());
            }
        }

        let keys = self.load_user(user_id)?;
        let secret = keys.get(provider_id).cloned();
        self.lock_cache().insert(user_id.to_string(), keys);
        Ok(secret)
    }

    /// Presence check without exposing the secret.
    pub fn has(&self, user_id: &str, provider_id: &str) -> Result<bool, StorageError> {
        Ok(self.get(user_id, provider_id)?.is_some())
    }

    /// Provider ids the user has stored a key for. Used by the settings
    /// surface to render presence booleans.
    pub fn configured(&self, user_id: &str) -> Result<HashSet<String>, StorageError> {
        {
            let cache = self.lock_cache();
            if let Some(keys) = cache.get(user_id) {
                return Ok(keys.keys().cloned().collect());
            }
        }
        let keys = self.load_user(user_id)?;
        let ids = keys.keys().cloned().collect();
        self.lock_cache().insert(user_id.to_string(), keys);
        Ok(ids)
    }

    fn load_user(&self, user_id: &str) -> Result<HashMap<String, String>, StorageError> {
        let record = self.records.read(SCOPE, user_id)?;
        let mut keys = HashMap::new();
        let Some(Value::Object(entries)) = record else {
            return Ok(keys);
        };
        for (provider_id, value) in entries {
            let Some(encoded) = value.as_str() else {
                return Err(StorageError::Invalid(format!(
                    "credential entry for {provider_id} is not a string"
                )));
            };
            let decoded = B64_ENGINE.decode(encoded.as_bytes()).map_err(|_| {
                StorageError::Invalid(format!("credential for {provider_id} failed to decode"))
            })?;
            let secret = String::from_utf8(decoded).map_err(|_| {
                StorageError::Invalid(format!("credential for {provider_id} was not valid UTF-8"))
            })?;
            keys.insert(provider_id, secret);
        }
        Ok(keys)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, String>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_pool, SqliteRecords};

    fn store() -> CredentialStore {
        CredentialStore::new(SqliteRecords::new(test_pool()))
    }

    #[test]
    fn absent_credential_reads_as_none() {
        let creds = store();
        assert_eq!(creds.get("alice", "openai").unwrap(), None);
        assert!(!creds.has("alice", "openai").unwrap());
    }

    #[test]
    fn users_do_not_leak_into_each_other() {
        let creds = store();
        creds.set("u1", "openai", "key-one").unwrap();
        creds.set("u2", "openai", "key-two").unwrap();
        assert_eq!(creds.get("u1", "openai").unwrap().as_deref(), Some("key-one"));
        assert_eq!(creds.get("u2", "openai").unwrap().as_deref(), Some("key-two"));
    }

    #[test]
    fn last_write_wins_per_pair() {
        let creds = store();
        creds.set("alice", "deepseek", "old").unwrap();
        creds.set("alice", "deepseek", "new").unwrap();
        assert_eq!(creds.get("alice", "deepseek").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn set_invalidates_the_cached_entry() {
        let creds = store();
        creds.set("alice", "openai", "first").unwrap();
        // populate the cache
        assert_eq!(creds.get("alice", "openai").unwrap().as_deref(), Some("first"));
        creds.set("alice", "openai", "second").unwrap();
        assert_eq!(creds.get("alice", "openai").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn empty_secret_removes_the_entry() {
        let creds = store();
        creds.set("alice", "openai", "key").unwrap();
        creds.set("alice", "openai", "  ").unwrap();
        assert_eq!(creds.get("alice", "openai").unwrap(), None);
    }

    #[test]
    fn configured_lists_only_providers_with_keys() {
        let creds = store();
        creds.set("alice", "openai", "key").unwrap();
        creds.set("alice", "gemini", "key").unwrap();
        let ids = creds.configured("alice").unwrap();
        assert!(ids.contains("openai"));
        assert!(ids.contains("gemini"));
        assert!(!ids.contains("anthropic"));
    }

    #[test]
    fn secrets_survive_a_fresh_store_over_the_same_records() {
        let records = SqliteRecords::new(test_pool());
        let first = CredentialStore::new(records.clone());
        first.set("alice", "anthropic", "persisted").unwrap();

        let second = CredentialStore::new(records);
        assert_eq!(
            second.get("alice", "anthropic").unwrap().as_deref(),
            Some("persisted")
        );
    }
}
