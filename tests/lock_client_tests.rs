// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests exercising the lock client end-to-end against the
//! bundled in-memory store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use advisory_lock::memory_store::MemoryStore;
use advisory_lock::{
    AcquireOptions, Client, ClientOptionsBuilder, ErrorKind, HeartbeatOptions, LockItem,
    StoreAdapter, StoreError, TableRef, UpdateFields,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const TABLE: TableRef<'static> = TableRef {
    table: "lockTable",
    partition_key_name: "key",
};

#[tokio::test]
async fn uncontested_acquire_and_release_round_trips_through_a_tombstone() {
    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .owner_name("me")
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();

    let handle = client
        .acquire(
            "lockName",
            AcquireOptions {
                data: b"data".to_vec(),
                ..AcquireOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(handle.owner_name(), "me");
    assert_eq!(handle.data().await, b"data");
    assert!(!handle.is_released().await);

    client.release(&handle, Default::default()).await.unwrap();
    assert!(handle.is_released().await);

    // The row is now a tombstone, not absent — re-acquiring must succeed
    // immediately via the "released" branch rather than timing out.
    let reacquired = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();
    assert_ne!(reacquired.record_version_number().await, handle.record_version_number().await);
}

#[tokio::test]
async fn delete_on_release_leaves_the_row_absent() {
    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();

    let handle = client
        .acquire(
            "lockName",
            AcquireOptions {
                delete_on_release: true,
                ..AcquireOptions::default()
            },
        )
        .await
        .unwrap();
    client.release(&handle, Default::default()).await.unwrap();

    // Row is gone outright, so re-acquire takes the "absent" branch.
    let reacquired = client.acquire("lockName", AcquireOptions::default()).await;
    assert!(reacquired.is_ok());
}

#[tokio::test]
async fn heartbeat_reconciles_a_transient_error_that_landed_after_the_write_applied() {
    let store = FlakyStore::new();
    store.queue_update(Injection::ApplyThenError(InjectedKind::Transient));

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();
    let rvn_after_acquire = handle.record_version_number().await;

    client.heartbeat(&handle, HeartbeatOptions::default()).await.unwrap();
    let rvn_after_first = handle.record_version_number().await;
    assert_ne!(rvn_after_first, rvn_after_acquire);

    // Second heartbeat hits the injected transient error; the write landed
    // at the store before it, so this call must still report success with
    // the handle advanced to the new RVN.
    client.heartbeat(&handle, HeartbeatOptions::default()).await.unwrap();
    let rvn_after_reconciled = handle.record_version_number().await;
    assert_ne!(rvn_after_reconciled, rvn_after_first);

    // A normal heartbeat afterward must still succeed.
    client.heartbeat(&handle, HeartbeatOptions::default()).await.unwrap();
}

#[tokio::test]
async fn heartbeat_reconciles_a_cancellation_that_landed_after_the_write_applied() {
    let store = FlakyStore::new();
    store.queue_update(Injection::ApplyThenError(InjectedKind::Cancelled));

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();
    let rvn_after_acquire = handle.record_version_number().await;

    client.heartbeat(&handle, HeartbeatOptions::default()).await.unwrap();
    let rvn_after_reconciled = handle.record_version_number().await;
    assert_ne!(rvn_after_reconciled, rvn_after_acquire);

    client.heartbeat(&handle, HeartbeatOptions::default()).await.unwrap();
}

#[tokio::test]
async fn stolen_lock_fails_the_heartbeat_and_then_fails_fast() {
    let shared_store = Arc::new(MemoryStore::new());
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .owner_name("me")
        .build()
        .unwrap();
    let client = Client::new(Arc::clone(&shared_store), "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    // Simulate another client winning a race behind this client's back.
    let current = shared_store
        .get(TABLE, "lockName", &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    shared_store
        .update_if_rvn_matches(
            TABLE,
            "lockName",
            &current.record_version_number,
            UpdateFields {
                record_version_number: Some("stolen-rvn".to_string()),
                owner_name: Some("other".to_string()),
                ..UpdateFields::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let result = client.heartbeat(&handle, HeartbeatOptions::default()).await;
    assert!(matches!(result.unwrap_err().kind(), ErrorKind::LockStolen));
    assert!(handle.is_released().await);

    let result = client.heartbeat(&handle, HeartbeatOptions::default()).await;
    assert!(matches!(result.unwrap_err().kind(), ErrorKind::LockReleased));
}

#[tokio::test]
async fn contended_acquire_waits_for_the_stalled_holder_to_expire() {
    let shared_store = Arc::new(MemoryStore::new());
    let options_a = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_millis(300))
        .owner_name("a")
        .build()
        .unwrap();
    let client_a = Client::new(Arc::clone(&shared_store), "lockTable", options_a).unwrap();
    let handle_a = client_a
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    let options_b = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_millis(300))
        .owner_name("b")
        .build()
        .unwrap();
    let client_b = Client::new(Arc::clone(&shared_store), "lockTable", options_b).unwrap();

    let start = std::time::Instant::now();
    let handle_b = client_b
        .acquire(
            "lockName",
            AcquireOptions {
                additional_time_to_wait_for_lock: Duration::from_secs(2),
                refresh_period: Duration::from_millis(30),
                ..AcquireOptions::default()
            },
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(300));
    assert_ne!(
        handle_b.record_version_number().await,
        handle_a.record_version_number().await
    );
    assert_eq!(handle_b.owner_name(), "b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_grants_exactly_one_non_released_handle() {
    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Arc::new(Client::new(store, "lockTable", options).unwrap());

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.acquire("lockName", AcquireOptions::default()).await })
        })
        .collect();

    let mut granted = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_ok() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1, "exactly one concurrent acquire must win the race");
}

#[tokio::test]
async fn acquire_retries_a_transient_read_error_within_its_poll_budget() {
    let store = FlakyStore::new();
    store.queue_get_failure(InjectedKind::Transient);

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();

    let handle = client
        .acquire(
            "lockName",
            AcquireOptions {
                additional_time_to_wait_for_lock: Duration::from_secs(2),
                refresh_period: Duration::from_millis(20),
                ..AcquireOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!handle.is_released().await);
}

#[tokio::test]
async fn acquire_propagates_a_transient_error_once_its_poll_budget_is_exhausted() {
    let store = FlakyStore::new();
    store.queue_get_failure(InjectedKind::Transient);

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();

    // `additional_time_to_wait_for_lock` defaults to zero, so the poll budget
    // is already exhausted by the time the single failing read returns.
    let result = client.acquire("lockName", AcquireOptions::default()).await;
    assert!(matches!(result.unwrap_err().kind(), ErrorKind::StoreUnavailable(_)));
}

#[tokio::test]
async fn heartbeat_with_retries_needs_no_actual_retry_when_reconciliation_succeeds() {
    let store = FlakyStore::new();
    store.queue_update(Injection::ApplyThenError(InjectedKind::Transient));

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    client
        .heartbeat_with_retries(&handle, 3, Duration::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn heartbeat_with_retries_succeeds_on_the_final_attempt() {
    let store = FlakyStore::new();
    for _ in 0..3 {
        store.queue_update(Injection::ErrorWithoutApplying(InjectedKind::Transient));
    }

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    client
        .heartbeat_with_retries(&handle, 3, Duration::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn heartbeat_with_retries_gives_up_after_exhausting_the_budget() {
    let store = FlakyStore::new();
    for _ in 0..4 {
        store.queue_update(Injection::ErrorWithoutApplying(InjectedKind::Transient));
    }

    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    let result = client
        .heartbeat_with_retries(&handle, 3, Duration::ZERO)
        .await;
    assert!(matches!(result.unwrap_err().kind(), ErrorKind::StoreUnavailable(_)));
}

#[tokio::test]
async fn close_best_effort_releases_outstanding_handles() {
    let shared_store = Arc::new(MemoryStore::new());
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(Arc::clone(&shared_store), "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    client.close().await.unwrap();
    assert!(handle.is_released().await);
}

#[tokio::test]
async fn scheduled_heartbeat_marks_the_handle_released_on_an_inconclusive_failure() {
    let shared_store = Arc::new(FlakyStore::new());
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_millis(300))
        .heartbeat_period(Duration::from_millis(100))
        .build()
        .unwrap();
    let client = Client::new(Arc::clone(&shared_store), "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    // Every scheduled heartbeat attempt for the rest of this test fails
    // without applying, so reconciliation can never confirm the write
    // landed — the scheduler has no caller to hand the error back to and
    // must give up on the handle itself.
    for _ in 0..8 {
        shared_store.queue_update(Injection::ErrorWithoutApplying(InjectedKind::Transient));
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(handle.is_released().await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn release_writes_a_final_payload_when_requested() {
    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();
    let handle = client
        .acquire("lockName", AcquireOptions::default())
        .await
        .unwrap();

    client
        .release(
            &handle,
            advisory_lock::ReleaseOptions {
                data: Some(b"farewell".to_vec()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(handle.data().await, b"farewell");
}

#[tokio::test]
async fn new_rejects_an_empty_table_name() {
    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .build()
        .unwrap();
    let result = Client::new(store, "", options);
    assert!(matches!(
        result.unwrap_err().kind(),
        ErrorKind::TableNameLengthZero
    ));
}

#[tokio::test]
async fn new_rejects_an_empty_owner_name() {
    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(30))
        .owner_name(String::new())
        .build()
        .unwrap();
    let result = Client::new(store, "lockTable", options);
    assert!(matches!(
        result.unwrap_err().kind(),
        ErrorKind::OwnerNameLengthZero
    ));
}

/// A [`StoreAdapter`] wrapping [`MemoryStore`] that lets a test script the
/// outcome of upcoming `update_if_rvn_matches` and `get` calls, to exercise
/// the heartbeat engine's reconciliation-by-re-read path and the acquisition
/// engine's retry-within-poll-budget path without a real backend.
struct FlakyStore {
    inner: MemoryStore,
    update_queue: Mutex<VecDeque<Injection>>,
    get_queue: Mutex<VecDeque<InjectedKind>>,
}

enum Injection {
    /// The write actually lands at the store, then the call reports `kind`.
    ApplyThenError(InjectedKind),
    /// The write never reaches the store; the call reports `kind` outright.
    ErrorWithoutApplying(InjectedKind),
}

enum InjectedKind {
    Transient,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("injected transient failure")]
struct InjectedTransientError;

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            update_queue: Mutex::new(VecDeque::new()),
            get_queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue_update(&self, injection: Injection) {
        self.update_queue.lock().unwrap().push_back(injection);
    }

    fn queue_get_failure(&self, kind: InjectedKind) {
        self.get_queue.lock().unwrap().push_back(kind);
    }
}

fn injected_error(kind: &InjectedKind) -> StoreError {
    match kind {
        InjectedKind::Transient => StoreError::other(InjectedTransientError),
        InjectedKind::Cancelled => StoreError::Cancelled,
    }
}

#[async_trait]
impl StoreAdapter for FlakyStore {
    async fn get(
        &self,
        table: TableRef<'_>,
        key: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<LockItem>, StoreError> {
        if let Some(kind) = self.get_queue.lock().unwrap().pop_front() {
            return Err(injected_error(&kind));
        }
        self.inner.get(table, key, cancellation).await
    }

    async fn put_if_absent(
        &self,
        table: TableRef<'_>,
        item: LockItem,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.inner.put_if_absent(table, item, cancellation).await
    }

    async fn update_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        fields: UpdateFields,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let injected = self.update_queue.lock().unwrap().pop_front();
        match injected {
            None => self.inner.update_if_rvn_matches(table, key, expected_rvn, fields, cancellation).await,
            Some(Injection::ApplyThenError(kind)) => {
                self.inner
                    .update_if_rvn_matches(table, key, expected_rvn, fields, cancellation)
                    .await?;
                Err(injected_error(&kind))
            }
            Some(Injection::ErrorWithoutApplying(kind)) => Err(injected_error(&kind)),
        }
    }

    async fn delete_if_rvn_matches(
        &self,
        table: TableRef<'_>,
        key: &str,
        expected_rvn: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.inner.delete_if_rvn_matches(table, key, expected_rvn, cancellation).await
    }
}
