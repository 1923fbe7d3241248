//! SQLite-backed offset store (spec §4.A).
//!
//! Mirrors `original_source/Offsets.py`'s role exactly, but as an owned
//! handle passed into the apply loop rather than a module-level global
//! connection (spec §9).

use std::path::Path;

use async_trait::async_trait;
use cdc_core::error::OffsetStoreError;
use cdc_core::types::Lsn;
use cdc_core::traits::OffsetStore as OffsetStoreTrait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Durable `slot_name -> last_applied_lsn` mapping (spec §6 schema:
/// `lsn_offsets(slot_name TEXT PRIMARY KEY, last_applied_lsn TEXT NOT
/// NULL)`).
pub struct SqliteOffsetStore {
    pool: SqlitePool,
}

impl SqliteOffsetStore {
    /// Open (creating if absent) the SQLite database at `path`, along
    /// with any missing parent directories, and ensure the offsets
    /// table exists. Idempotent — safe to call on every startup.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OffsetStoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    OffsetStoreError::StorageUnavailable(format!(
                        "failed to create parent directory for {}: {err}",
                        path.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|err| {
                OffsetStoreError::StorageUnavailable(format!(
                    "failed to open offset store at {}: {err}",
                    path.display()
                ))
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS lsn_offsets (
                slot_name TEXT PRIMARY KEY,
                last_applied_lsn TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|err| {
            OffsetStoreError::StorageUnavailable(format!("failed to create lsn_offsets table: {err}"))
        })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl OffsetStoreTrait for SqliteOffsetStore {
    async fn get(&self, slot: &str) -> Result<Option<Lsn>, OffsetStoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_applied_lsn FROM lsn_offsets WHERE slot_name = ?")
                .bind(slot)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| OffsetStoreError::StorageUnavailable(err.to_string()))?;

        Ok(row.map(|(lsn,)| Lsn(lsn)))
    }

    async fn set(&self, slot: &str, lsn: &Lsn) -> Result<(), OffsetStoreError> {
        sqlx::query(
            "INSERT INTO lsn_offsets(slot_name, last_applied_lsn) VALUES (?, ?)
             ON CONFLICT(slot_name) DO UPDATE SET last_applied_lsn = excluded.last_applied_lsn",
        )
        .bind(slot)
        .bind(lsn.as_str())
        .execute(&self.pool)
        .await
        .map_err(|err| OffsetStoreError::StorageUnavailable(err.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_on_fresh_slot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteOffsetStore::open(dir.path().join("offsets.sqlite"))
            .await
            .unwrap();

        assert_eq!(store.get("cdc_slot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteOffsetStore::open(dir.path().join("offsets.sqlite"))
            .await
            .unwrap();

        store.set("cdc_slot", &Lsn::from("0/10")).await.unwrap();
        assert_eq!(
            store.get("cdc_slot").await.unwrap(),
            Some(Lsn::from("0/10"))
        );
    }

    #[tokio::test]
    async fn set_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteOffsetStore::open(dir.path().join("offsets.sqlite"))
            .await
            .unwrap();

        store.set("cdc_slot", &Lsn::from("0/10")).await.unwrap();
        store.set("cdc_slot", &Lsn::from("0/20")).await.unwrap();
        assert_eq!(
            store.get("cdc_slot").await.unwrap(),
            Some(Lsn::from("0/20"))
        );
    }

    #[tokio::test]
    async fn open_is_idempotent_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offsets.sqlite");

        let store1 = SqliteOffsetStore::open(&path).await.unwrap();
        store1.set("cdc_slot", &Lsn::from("0/10")).await.unwrap();
        drop(store1);

        let store2 = SqliteOffsetStore::open(&path).await.unwrap();
        assert_eq!(
            store2.get("cdc_slot").await.unwrap(),
            Some(Lsn::from("0/10"))
        );
    }

    #[tokio::test]
    async fn different_slots_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteOffsetStore::open(dir.path().join("offsets.sqlite"))
            .await
            .unwrap();

        store.set("slot_a", &Lsn::from("0/10")).await.unwrap();
        store.set("slot_b", &Lsn::from("0/99")).await.unwrap();

        assert_eq!(store.get("slot_a").await.unwrap(), Some(Lsn::from("0/10")));
        assert_eq!(store.get("slot_b").await.unwrap(), Some(Lsn::from("0/99")));
    }
}
