// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Façade holding identity, defaults, and the background heartbeat scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::acquire::{self, AcquireOptions};
use crate::error::{Error, ErrorKind};
use crate::handle::LockHandle;
use crate::heartbeat::{self, HeartbeatOptions};
use crate::release::{self, ReleaseOptions};
use crate::rvn::RvnGenerator;
use crate::store::{StoreAdapter, TableRef};

/// Options recognized by [`Client::new`] (spec §4.4).
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ClientOptions {
    /// Default lease applied to new acquisitions.
    pub lease_duration: Duration,
    /// If non-zero, a background scheduler heartbeats every held handle at
    /// this interval. Zero disables background heartbeats.
    #[builder(default = "Duration::ZERO")]
    pub heartbeat_period: Duration,
    /// Identity stamped into items written by this client. Defaults to a
    /// freshly generated id if not supplied.
    #[builder(default = "default_owner_name()")]
    pub owner_name: String,
    /// Name of the primary-key attribute in the backing store.
    #[builder(default = "\"key\".to_string()")]
    pub partition_key_name: String,
}

fn default_owner_name() -> String {
    Uuid::new_v4().to_string()
}

impl ClientOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        let heartbeat_period = self.heartbeat_period.unwrap_or(Duration::ZERO);
        let Some(lease_duration) = self.lease_duration else {
            return Err("lease_duration is required".to_string());
        };
        if heartbeat_period > Duration::ZERO && heartbeat_period * 2 > lease_duration {
            return Err(
                "heartbeat_period * 2 must not exceed lease_duration".to_string(),
            );
        }
        if self.owner_name.as_deref().is_some_and(str::is_empty) {
            return Err("owner_name must not be empty".to_string());
        }
        Ok(())
    }
}

/// The lock client façade (spec §4.4, component C8).
///
/// Safe for concurrent use by multiple tasks. Owns the set of handles it has
/// acquired and, when `heartbeat_period > 0`, a single cooperative background
/// task that heartbeats all of them.
pub struct Client<S: StoreAdapter> {
    store: Arc<S>,
    table: String,
    options: ClientOptions,
    rvn_generator: Arc<RvnGenerator>,
    active_handles: Arc<AsyncMutex<HashMap<String, Arc<LockHandle>>>>,
    scheduler_cancellation: CancellationToken,
    scheduler_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<S: StoreAdapter + 'static> Client<S> {
    /// Creates a new lock client against `store`, scoped to `table` (spec
    /// §4.4/§6.3 `NewClient(store, table, options…)`).
    ///
    /// # Errors
    /// Returns [`ErrorKind::TableNameLengthZero`] if `table` is empty,
    /// [`ErrorKind::OwnerNameLengthZero`] if `options.owner_name` is empty, or
    /// [`Error`] of kind [`ErrorKind::InvalidArgument`] if `options` violates
    /// the `heartbeat_period * 2 <= lease_duration` invariant (this should
    /// already have been rejected by [`ClientOptionsBuilder::build`] unless
    /// constructed by hand).
    pub fn new(store: S, table: impl Into<String>, options: ClientOptions) -> Result<Self, Error> {
        let table = table.into();
        if table.is_empty() {
            return Err(Error::new(ErrorKind::TableNameLengthZero));
        }
        if options.owner_name.is_empty() {
            return Err(Error::new(ErrorKind::OwnerNameLengthZero));
        }
        if options.heartbeat_period > Duration::ZERO
            && options.heartbeat_period * 2 > options.lease_duration
        {
            return Err(Error::new(ErrorKind::InvalidArgument(
                "heartbeat_period * 2 must not exceed lease_duration".to_string(),
            )));
        }

        let active_handles = Arc::new(AsyncMutex::new(HashMap::new()));
        let scheduler_cancellation = CancellationToken::new();
        let store = Arc::new(store);
        let rvn_generator = Arc::new(RvnGenerator::new());

        let scheduler_task = if options.heartbeat_period > Duration::ZERO {
            Some(spawn_heartbeat_scheduler(
                Arc::clone(&store),
                table.clone(),
                options.partition_key_name.clone(),
                Arc::clone(&rvn_generator),
                Arc::clone(&active_handles),
                options.heartbeat_period,
                scheduler_cancellation.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            store,
            table,
            options,
            rvn_generator,
            active_handles,
            scheduler_cancellation,
            scheduler_task: AsyncMutex::new(scheduler_task),
        })
    }

    fn table_ref(&self) -> TableRef<'_> {
        TableRef {
            table: &self.table,
            partition_key_name: &self.options.partition_key_name,
        }
    }

    /// Removes `handle` from the active set, but only if the entry currently
    /// stored under its name is `handle` itself.
    ///
    /// A lock name can be reacquired by this client after `handle` was lost,
    /// producing a second, unrelated `Arc<LockHandle>` under the same map key.
    /// Evicting by name alone would then silently drop that live handle from
    /// the background scheduler's bookkeeping whenever a caller acts on its
    /// own stale reference (spec §5: safe for concurrent use).
    async fn forget_handle(&self, handle: &LockHandle) {
        let mut active_handles = self.active_handles.lock().await;
        if active_handles
            .get(handle.name())
            .is_some_and(|stored| std::ptr::eq(stored.as_ref(), handle))
        {
            active_handles.remove(handle.name());
        }
    }

    /// Waits until `name` is available (if not already) and attempts to
    /// acquire it (spec §4.5).
    ///
    /// # Errors
    /// Returns [`ErrorKind::LockNotGranted`] if `options.additional_time_to_wait_for_lock`
    /// elapses first, or [`ErrorKind::StoreUnavailable`] if the store adapter
    /// fails outside the poll budget.
    pub async fn acquire(
        &self,
        name: impl Into<String>,
        options: AcquireOptions,
    ) -> Result<Arc<LockHandle>, Error> {
        let handle = acquire::acquire(
            self.store.as_ref(),
            self.table_ref(),
            &self.rvn_generator,
            &self.options,
            name.into(),
            options,
        )
        .await?;

        let handle = Arc::new(handle);
        self.active_handles
            .lock()
            .await
            .insert(handle.name().to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Refreshes the lease on `handle` by writing a new RVN (spec §4.6).
    ///
    /// # Errors
    /// Returns [`ErrorKind::LockReleased`] if the handle is already released,
    /// [`ErrorKind::LockStolen`] if another client's write won the race, or
    /// the original store error if the write's outcome could not be
    /// reconciled.
    pub async fn heartbeat(
        &self,
        handle: &LockHandle,
        options: HeartbeatOptions,
    ) -> Result<(), Error> {
        let result = heartbeat::heartbeat(self.store.as_ref(), self.table_ref(), &self.rvn_generator, handle, &options).await;
        if matches!(
            result,
            Err(ref e) if matches!(e.kind(), ErrorKind::LockStolen | ErrorKind::LockReleased)
        ) {
            self.forget_handle(handle).await;
        }
        result
    }

    /// Heartbeats `handle`, retrying up to `count` additional times on
    /// inconclusive (non-`ConditionalFailure`) errors only (spec §4.6 step 5).
    ///
    /// # Errors
    /// Same as [`Client::heartbeat`].
    pub async fn heartbeat_with_retries(
        &self,
        handle: &LockHandle,
        count: u32,
        backoff: Duration,
    ) -> Result<(), Error> {
        let result = heartbeat::heartbeat_with_retries(
            self.store.as_ref(),
            self.table_ref(),
            &self.rvn_generator,
            handle,
            count,
            backoff,
        )
        .await;
        if matches!(
            result,
            Err(ref e) if matches!(e.kind(), ErrorKind::LockStolen | ErrorKind::LockReleased)
        ) {
            self.forget_handle(handle).await;
        }
        result
    }

    /// Releases `handle` (spec §4.7). Always terminal for the handle, even
    /// on error.
    ///
    /// # Errors
    /// Returns [`ErrorKind::LockAlreadyReleased`] (non-fatal) if the handle
    /// was already lost, or the original store error otherwise.
    pub async fn release(&self, handle: &LockHandle, options: ReleaseOptions) -> Result<(), Error> {
        self.forget_handle(handle).await;
        release::release(self.store.as_ref(), self.table_ref(), &self.rvn_generator, handle, options).await
    }

    /// Cancels the background scheduler, best-effort releases every
    /// outstanding handle (errors logged, not propagated — spec §9 Open
    /// Question), and awaits the scheduler task.
    ///
    /// # Errors
    /// This call does not fail on a per-handle release error; it only
    /// returns an error if the scheduler task itself could not be joined.
    pub async fn close(&self) -> Result<(), Error> {
        self.scheduler_cancellation.cancel();
        if let Some(task) = self.scheduler_task.lock().await.take() {
            if let Err(join_error) = task.await {
                log::warn!("heartbeat scheduler task panicked during close: {join_error}");
            }
        }

        let handles: Vec<Arc<LockHandle>> =
            self.active_handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = release::release(self.store.as_ref(), self.table_ref(), &self.rvn_generator, &handle, ReleaseOptions::default()).await {
                log::warn!(
                    "best-effort release of '{}' during close failed: {e}",
                    handle.name()
                );
            }
        }
        Ok(())
    }
}

/// Spawns the single cooperative background heartbeat loop for a client.
///
/// Deliberately one task per client, not one task per held lock, to bound
/// resource usage regardless of how many locks a client holds (spec §9).
fn spawn_heartbeat_scheduler<S: StoreAdapter + 'static>(
    store: Arc<S>,
    table: String,
    partition_key_name: String,
    rvn_generator: Arc<RvnGenerator>,
    active_handles: Arc<AsyncMutex<HashMap<String, Arc<LockHandle>>>>,
    period: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let table_ref = TableRef {
            table: &table,
            partition_key_name: &partition_key_name,
        };
        loop {
            tokio::select! {
                () = cancellation.cancelled() => break,
                () = tokio::time::sleep(period) => {}
            }

            let snapshot: Vec<Arc<LockHandle>> =
                active_handles.lock().await.values().cloned().collect();

            let mut stale = Vec::new();
            for handle in snapshot {
                let outcome = heartbeat::heartbeat(
                    store.as_ref(),
                    table_ref,
                    &rvn_generator,
                    &handle,
                    &HeartbeatOptions::default(),
                )
                .await;
                // Every failure path here — stolen, released, or an
                // inconclusive store error the scheduler has no caller to
                // report back to — means this client gives up on the handle.
                if let Err(e) = outcome {
                    log::warn!("scheduled heartbeat for '{}' failed: {e}", handle.name());
                    handle.mark_released().await;
                    stale.push(handle.name().to_string());
                }
            }

            if !stale.is_empty() {
                let mut active_handles = active_handles.lock().await;
                for name in stale {
                    active_handles.remove(&name);
                }
            }
        }
    })
}
