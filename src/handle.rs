// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory representation of a held lock.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// The part of a [`LockHandle`] that mutates; always touched behind the
/// handle's mutex (spec §3.2 invariant 2).
pub(crate) struct HandleState {
    pub(crate) record_version_number: String,
    pub(crate) data: Vec<u8>,
    pub(crate) acquired_at: Instant,
    pub(crate) released: bool,
}

/// A held lock. One instance exists per successful [`crate::client::Client::acquire`]
/// call; mutated only by the heartbeat and release engines (spec §3.2, §3.3).
///
/// Holding a non-released `LockHandle` means "I am logically the owner of
/// this lock name" for as long as its RVN matches the store's RVN for that
/// row (spec §3.2 invariant 1). Releasing a handle is terminal — it never
/// re-enters the held state (invariant 5).
pub struct LockHandle {
    name: String,
    owner_name: String,
    lease_duration: Duration,
    delete_on_release: bool,
    state: Mutex<HandleState>,
}

impl LockHandle {
    pub(crate) fn new(
        name: String,
        owner_name: String,
        record_version_number: String,
        lease_duration: Duration,
        data: Vec<u8>,
        delete_on_release: bool,
    ) -> Self {
        Self {
            name,
            owner_name,
            lease_duration,
            delete_on_release,
            state: Mutex::new(HandleState {
                record_version_number,
                data,
                acquired_at: Instant::now(),
                released: false,
            }),
        }
    }

    /// The lock name this handle refers to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identity that acquired this handle.
    #[must_use]
    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    /// The lease duration this handle was acquired (and is renewed) with.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Whether [`crate::client::Client::release`] deletes the row outright
    /// instead of tombstoning it, as chosen at acquisition time.
    #[must_use]
    pub(crate) fn delete_on_release(&self) -> bool {
        self.delete_on_release
    }

    /// The payload carried by this handle as of its last successful write.
    pub async fn data(&self) -> Vec<u8> {
        self.state.lock().await.data.clone()
    }

    /// Whether this handle has been released, stolen, or otherwise
    /// terminated. Once `true`, always `true` (spec §3.2 invariant 5).
    pub async fn is_released(&self) -> bool {
        self.state.lock().await.released
    }

    /// The RVN this handle last successfully wrote (spec §3.2 invariant 4).
    pub async fn record_version_number(&self) -> String {
        self.state.lock().await.record_version_number.clone()
    }

    /// Locks the handle's mutable state for the duration of a heartbeat or
    /// release attempt. The guard may be held across a store call — this is
    /// intentional (spec §5) and is what excludes concurrent mutation of the
    /// same handle.
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, HandleState> {
        self.state.lock().await
    }

    /// Marks the handle released without going through the heartbeat or
    /// release engines. Used by the background scheduler when it gives up on
    /// a handle after an inconclusive heartbeat failure, so that
    /// `is_released` reflects reality instead of the handle being silently
    /// abandoned (spec §4.6).
    pub(crate) async fn mark_released(&self) {
        self.state.lock().await.released = true;
    }
}
