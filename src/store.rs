// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Abstract conditional key-value store the lock client is built on.
//!
//! This module deliberately knows nothing about wire formats, transports, or
//! retry policies of any particular backend. It only assumes the backend can
//! provide a strongly-consistent read and three flavors of conditional write
//! over a single table keyed by lock name.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::record::LockItem;

/// Error surfaced by a [`StoreAdapter`].
///
/// The only distinction the lock client relies on is whether a write's
/// precondition was not met ([`StoreError::ConditionalFailure`]) versus
/// anything else. Any other error is treated as potentially-partially-succeeded:
/// the backend may have applied the write before reporting failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write's precondition (row absent, or `recordVersionNumber` equal
    /// to the expected value) did not hold at the backend.
    #[error("conditional write precondition not met")]
    ConditionalFailure,
    /// The calling operation was cancelled before the backend confirmed an
    /// outcome. Must be treated identically to [`StoreError::Other`] by any
    /// caller that relies on reconciliation (see the heartbeat engine).
    #[error("operation cancelled before the store confirmed an outcome")]
    Cancelled,
    /// Any other backend failure: network error, timeout, malformed request,
    /// authorization failure, 5xx, etc. May have partially succeeded.
    #[error("store adapter error: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps an arbitrary backend error as [`StoreError::Other`].
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Other(Box::new(error))
    }
}

/// Identifies which table and which primary-key attribute name a store call
/// targets (spec §4.4 `partitionKeyName`, §6.3 `NewClient(store, table,
/// options…)`).
///
/// A single [`StoreAdapter`] may be shared across multiple [`crate::Client`]s
/// pointed at different tables or schemas (the same way a single DynamoDB SDK
/// client is shared across tables), so the lock engines pass this alongside
/// every call rather than assuming it's baked into the adapter.
#[derive(Clone, Copy, Debug)]
pub struct TableRef<'a> {
    /// Name of the table the row lives in.
    pub table: &'a str,
    /// Name of the primary-key attribute within that table (default `"key"`).
    pub partition_key_name: &'a str,
}

/// The fields a conditional update is allowed to change on an existing row.
///
/// `None` leaves the corresponding persisted field untouched; this is how the
/// acquisition engine can, for instance, advance the RVN and owner without
/// touching `data` when a caller doesn't supply a new payload.
#[derive(Clone, Debug, Default)]
pub struct UpdateFields {
    /// New value for `recordVersionNumber`. Always supplied by callers in
    /// this crate since every conditional update mints a fresh RVN.
    pub record_version_number: Option<String>,
    /// New value for `ownerName`.
    pub owner_name: Option<String>,
    /// New value for `data`, if the caller chose to replace the payload.
    pub data: Option<Vec<u8>>,
    /// New value for `isReleased`.
    pub is_released: Option<bool>,
    /// New value for `leaseDuration`.
    pub lease_duration_ms: Option<u64>,
}

/// Narrow capability the lock client depends on: strongly-consistent reads
/// and conditional single-item writes over a table keyed by lock name.
///
/// Implement this trait against whatever conditional key-value store is
/// available (a document database, a distributed KV store with CAS, or — for
/// tests — [`crate::memory_store::MemoryStore`]); the lock client never sees
/// the backend's wire protocol.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Strongly-consistent read of the row for `key`. Returns `Ok(None)` if
    /// absent.
    async fn get(
        &self,
        table: TableRef<'_>,
        key: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<LockItem>, StoreError>;

    /// Inserts `item` iff no row with `item.key` currently exists.
    async fn put_if_absent(
        &self,
        table: TableRef<'_>,
        item: LockItem,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Atomically applies `fields` to the row for `key` iff its current
    /// `recordVersionNumber` equals `expected_rvn`.
    async fn update_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        fields: UpdateFields,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Deletes the row for `key` iff its current `recordVersionNumber`
    /// equals `expected_rvn`.
    async fn delete_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: StoreAdapter + ?Sized> StoreAdapter for Arc<T> {
    async fn get(
        &self,
        table: TableRef<'_>,
        key: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<LockItem>, StoreError> {
        self.as_ref().get(table, key, cancellation).await
    }

    async fn put_if_absent(
        &self,
        table: TableRef<'_>,
        item: LockItem,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.as_ref().put_if_absent(table, item, cancellation).await
    }

    async fn update_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        fields: UpdateFields,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.as_ref()
            .update_if_rvn_matches(table, key, expected_rvn, fields, cancellation)
            .await
    }

    async fn delete_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.as_ref()
            .delete_if_rvn_matches(table, key, expected_rvn, cancellation)
            .await
    }
}
