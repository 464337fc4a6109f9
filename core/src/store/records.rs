//! Transactional key-value record store.
//!
//! Credentials and conversation memory persist through this interface: one
//! JSON value per `(scope, key)` record. `update` is a read-modify-write of a
//! single record executed under one process-wide exclusion point, so
//! concurrent writers cannot interleave inside a cycle; callers tolerate
//! last-writer-wins at record granularity. Keeping the contract this narrow
//! lets the implementation move to sharded locking later without touching
//! call sites.

use std::sync::{Arc, Mutex};

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;

use crate::errors::StorageError;
use crate::store::DbPool;

pub trait RecordStore: Send + Sync {
    /// Fetch one record. Absence is a normal state, not an error.
    fn read(&self, scope: &str, key: &str) -> Result<Option<Value>, StorageError>;

    /// Overwrite one record.
    fn write(&self, scope: &str, key: &str, value: &Value) -> Result<(), StorageError>;

    /// Atomic read-modify-write of one record. `apply` receives the current
    /// value (`None` when the record does not exist yet) and returns the
    /// replacement, which is also handed back to the caller.
    fn update(
        &self,
        scope: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<Value>) -> Value,
    ) -> Result<Value, StorageError>;
}

/// SQLite-backed record store.
///
/// The mutex is held only for the duration of one read/write cycle, never
/// across a network call.
pub struct SqliteRecords {
    pool: DbPool,
    gate: Mutex<()>,
}

impl SqliteRecords {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            gate: Mutex::new(()),
        })
    }

    fn select(conn: &rusqlite::Connection, scope: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM records WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn upsert(conn: &rusqlite::Connection, scope: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO records (scope, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![scope, key, value.to_string(), now],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteRecords {
    fn read(&self, scope: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let conn = self.pool.get()?;
        Self::select(&conn, scope, key)
    }

    fn write(&self, scope: &str, key: &str, value: &Value) -> Result<(), StorageError> {
        let _gate = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = self.pool.get()?;
        Self::upsert(&conn, scope, key, value)
    }

    fn update(
        &self,
        scope: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<Value>) -> Value,
    ) -> Result<Value, StorageError> {
        let _gate = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = Self::select(&tx, scope, key)?;
        let next = apply(current);
        Self::upsert(&tx, scope, key, &next)?;
        tx.commit()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;
    use serde_json::json;

    #[test]
    fn read_of_missing_record_is_none() {
        let records = SqliteRecords::new(test_pool());
        assert!(records.read("memory", "store").unwrap().is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let records = SqliteRecords::new(test_pool());
        records.write("credentials", "alice", &json!({"openai": "abc"})).unwrap();
        let value = records.read("credentials", "alice").unwrap().unwrap();
        assert_eq!(value["openai"], "abc");
    }

    #[test]
    fn update_sees_previous_value_and_persists_result() {
        let records = SqliteRecords::new(test_pool());
        for i in 0..3 {
            let value = records
                .update("memory", "store", &mut |current| {
                    let mut list = current
                        .and_then(|v| v.as_array().cloned())
                        .unwrap_or_default();
                    list.push(json!(i));
                    Value::Array(list)
                })
                .unwrap();
            assert_eq!(value.as_array().unwrap().len(), i + 1);
        }
        let stored = records.read("memory", "store").unwrap().unwrap();
        assert_eq!(stored, json!([0, 1, 2]));
    }

    #[test]
    fn records_are_isolated_by_scope() {
        let records = SqliteRecords::new(test_pool());
        records.write("credentials", "k", &json!(1)).unwrap();
        records.write("memory", "k", &json!(2)).unwrap();
        assert_eq!(records.read("credentials", "k").unwrap().unwrap(), json!(1));
        assert_eq!(records.read("memory", "k").unwrap().unwrap(), json!(2));
    }
}
