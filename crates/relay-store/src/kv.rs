use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// JSON values keyed by string.
#[derive(Clone)]
pub struct KvStore {
    db: Database,
}

impl KvStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()?)
        })?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    /// Like [`get`](Self::get) with a fallback for missing keys.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StoreError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    #[instrument(skip(self, value))]
    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, json, now],
            )?;
            Ok(())
        })
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KvStore {
        KvStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn put_get_overwrite_delete() {
        let kv = store();
        assert_eq!(kv.get::<Vec<String>>("users").unwrap(), None);

        kv.put("users", &vec!["a".to_string()]).unwrap();
        assert_eq!(kv.get::<Vec<String>>("users").unwrap(), Some(vec!["a".to_string()]));

        kv.put("users", &vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(kv.get::<Vec<String>>("users").unwrap().unwrap().len(), 2);

        assert!(kv.delete("users").unwrap());
        assert!(!kv.delete("users").unwrap());
    }

    #[test]
    fn get_or_falls_back() {
        let kv = store();
        assert_eq!(kv.get_or("missing", 7u32).unwrap(), 7);
    }

    #[test]
    fn type_mismatch_is_serialization_error() {
        let kv = store();
        kv.put("n", "text").unwrap();
        assert!(matches!(kv.get::<u32>("n"), Err(StoreError::Serialization(_))));
    }
}
