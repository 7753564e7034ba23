// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `StoreAdapter` backed by an in-process map.
//!
//! Intended for tests and the bundled demo; never for production use. Models
//! the abstract store of spec §2 with nothing more than a `Mutex<HashMap>`
//! and the codec defined in [`crate::record`], so that item lifecycle bugs
//! show up in the engines rather than being masked by backend-specific
//! behavior.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::record::LockItem;
use crate::store::{StoreAdapter, StoreError, TableRef, UpdateFields};

/// In-memory [`StoreAdapter`]. Cheap to construct; clone the `Arc` you wrap
/// it in, don't clone the store itself.
///
/// Rows are keyed by `(table, key)`, so a single store can back clients
/// pointed at different tables without their rows colliding.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, String), Map<String, Value>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get(
        &self,
        table: TableRef<'_>,
        key: &str,
        _cancellation: &CancellationToken,
    ) -> Result<Option<LockItem>, StoreError> {
        let rows = self.rows.lock().expect("memory store mutex poisoned");
        rows.get(&(table.table.to_string(), key.to_string()))
            .map(|map| LockItem::decode(map.clone(), table.partition_key_name).map_err(StoreError::other))
            .transpose()
    }

    async fn put_if_absent(
        &self,
        table: TableRef<'_>,
        item: LockItem,
        _cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("memory store mutex poisoned");
        let row_key = (table.table.to_string(), item.key.clone());
        if rows.contains_key(&row_key) {
            return Err(StoreError::ConditionalFailure);
        }
        rows.insert(row_key, item.encode(table.partition_key_name));
        Ok(())
    }

    async fn update_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        fields: UpdateFields,
        _cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("memory store mutex poisoned");
        let row_key = (table.table.to_string(), key.to_string());
        let mut item = match rows.get(&row_key) {
            Some(map) => LockItem::decode(map.clone(), table.partition_key_name).map_err(StoreError::other)?,
            None => return Err(StoreError::ConditionalFailure),
        };
        if item.record_version_number != expected_rvn {
            return Err(StoreError::ConditionalFailure);
        }

        if let Some(rvn) = fields.record_version_number {
            item.record_version_number = rvn;
        }
        if let Some(owner_name) = fields.owner_name {
            item.owner_name = owner_name;
        }
        if let Some(data) = fields.data {
            item.data = data;
        }
        if let Some(is_released) = fields.is_released {
            item.is_released = is_released;
        }
        if let Some(lease_duration_ms) = fields.lease_duration_ms {
            item.lease_duration = std::time::Duration::from_millis(lease_duration_ms);
        }

        rows.insert(row_key, item.encode(table.partition_key_name));
        Ok(())
    }

    async fn delete_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        _cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("memory store mutex poisoned");
        let row_key = (table.table.to_string(), key.to_string());
        match rows.get(&row_key) {
            Some(map) => {
                let item = LockItem::decode(map.clone(), table.partition_key_name).map_err(StoreError::other)?;
                if item.record_version_number != expected_rvn {
                    return Err(StoreError::ConditionalFailure);
                }
            }
            None => return Err(StoreError::ConditionalFailure),
        }
        rows.remove(&row_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: TableRef<'static> = TableRef {
        table: "lockTable",
        partition_key_name: "key",
    };

    #[tokio::test]
    async fn put_if_absent_rejects_a_second_insert() {
        let store = MemoryStore::new();
        let cancellation = CancellationToken::new();
        let item = LockItem::new("lockName", "owner-1", "rvn-1", std::time::Duration::from_secs(30), Vec::new());

        store.put_if_absent(TABLE, item.clone(), &cancellation).await.unwrap();
        let result = store.put_if_absent(TABLE, item, &cancellation).await;
        assert!(matches!(result, Err(StoreError::ConditionalFailure)));
    }

    #[tokio::test]
    async fn update_rejects_a_stale_rvn() {
        let store = MemoryStore::new();
        let cancellation = CancellationToken::new();
        let item = LockItem::new("lockName", "owner-1", "rvn-1", std::time::Duration::from_secs(30), Vec::new());
        store.put_if_absent(TABLE, item, &cancellation).await.unwrap();

        let result = store
            .update_if_rvn_matches(
                TABLE,
                "lockName",
                "wrong-rvn",
                UpdateFields {
                    record_version_number: Some("rvn-2".to_string()),
                    ..UpdateFields::default()
                },
                &cancellation,
            )
            .await;
        assert!(matches!(result, Err(StoreError::ConditionalFailure)));
    }

    #[tokio::test]
    async fn get_returns_none_for_an_absent_key() {
        let store = MemoryStore::new();
        let cancellation = CancellationToken::new();
        assert!(store.get(TABLE, "missing", &cancellation).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rows_in_different_tables_do_not_collide() {
        let store = MemoryStore::new();
        let cancellation = CancellationToken::new();
        let other_table = TableRef {
            table: "otherTable",
            partition_key_name: "key",
        };
        let item = LockItem::new("lockName", "owner-1", "rvn-1", std::time::Duration::from_secs(30), Vec::new());

        store.put_if_absent(TABLE, item.clone(), &cancellation).await.unwrap();
        store.put_if_absent(other_table, item, &cancellation).await.unwrap();
        assert!(store.get(TABLE, "lockName", &cancellation).await.unwrap().is_some());
        assert!(store.get(other_table, "lockName", &cancellation).await.unwrap().is_some());
    }
}
