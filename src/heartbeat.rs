// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Heartbeat engine (spec §4.6, component C6): `Heartbeat(handle, options)`.
//!
//! The decisive invariant this module upholds: after any call to
//! [`heartbeat`] returns, `handle`'s RVN equals the store's RVN for its row,
//! or `handle` is released. A write whose outcome is ambiguous (cancelled, or
//! any non-`ConditionalFailure` store error) is never allowed to leave the
//! handle claiming an RVN the store doesn't agree with — it is reconciled by
//! re-reading the row before the call returns.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind};
use crate::handle::LockHandle;
use crate::rvn::RvnGenerator;
use crate::store::{StoreAdapter, StoreError, TableRef, UpdateFields};

/// Options for [`crate::client::Client::heartbeat`].
#[derive(Clone, Debug)]
pub struct HeartbeatOptions {
    /// New payload to write along with the renewed RVN. `None` leaves the
    /// handle's current `data` untouched.
    pub data: Option<Vec<u8>>,
    /// Cancellation token threaded through the store calls this heartbeat
    /// makes.
    pub cancellation: CancellationToken,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            data: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Renews `handle`'s lease by chaining a fresh RVN onto its current one.
///
/// # Errors
/// Returns [`ErrorKind::LockReleased`] if `handle` was already released
/// locally, [`ErrorKind::LockStolen`] if another client's write won the race
/// (`handle` is marked released), or [`ErrorKind::StoreUnavailable`] if the
/// write's outcome could not be reconciled and the handle's RVN is unchanged.
pub(crate) async fn heartbeat<S: StoreAdapter>(
    store: &S,
    table: TableRef<'_>,
    rvn_generator: &RvnGenerator,
    handle: &LockHandle,
    options: &HeartbeatOptions,
) -> Result<(), Error> {
    let mut state = handle.lock().await;
    if state.released {
        return Err(Error::new(ErrorKind::LockReleased));
    }

    let previous_rvn = state.record_version_number.clone();
    let new_rvn = rvn_generator.next();
    let fields = UpdateFields {
        record_version_number: Some(new_rvn.clone()),
        data: options.data.clone(),
        lease_duration_ms: Some(u64::try_from(handle.lease_duration().as_millis()).unwrap_or(u64::MAX)),
        ..UpdateFields::default()
    };

    match store
        .update_if_rvn_matches(table, handle.name(), &previous_rvn, fields, &options.cancellation)
        .await
    {
        Ok(()) => {
            state.record_version_number = new_rvn;
            if let Some(data) = &options.data {
                state.data.clone_from(data);
            }
            state.acquired_at = Instant::now();
            Ok(())
        }
        Err(StoreError::ConditionalFailure) => {
            // Precondition definitely failed: some other write landed first.
            state.released = true;
            Err(Error::new(ErrorKind::LockStolen))
        }
        Err(e) => reconcile_after_ambiguous_error(store, table, handle, &mut *state, &previous_rvn, &new_rvn, e).await,
    }
}

/// Reconciles an ambiguous write outcome by re-reading the row, so that by
/// the time [`heartbeat`] returns its decisive invariant holds again.
async fn reconcile_after_ambiguous_error<S: StoreAdapter>(
    store: &S,
    table: TableRef<'_>,
    handle: &LockHandle,
    state: &mut crate::handle::HandleState,
    previous_rvn: &str,
    attempted_rvn: &str,
    original: StoreError,
) -> Result<(), Error> {
    let reread = store.get(table, handle.name(), &CancellationToken::new()).await;
    match reread {
        Ok(Some(item))
            if item.record_version_number == attempted_rvn && item.owner_name == handle.owner_name() =>
        {
            // The write actually landed before the ambiguous error surfaced.
            state.record_version_number = attempted_rvn.to_string();
            state.acquired_at = Instant::now();
            Ok(())
        }
        Ok(Some(item))
            if item.record_version_number == previous_rvn
                && item.owner_name == handle.owner_name()
                && !item.is_released =>
        {
            // The write never applied; the handle is still exactly where it
            // was before this call. Surface the error without touching state.
            Err(Error::new(ErrorKind::StoreUnavailable(original)))
        }
        Ok(_) => {
            // Either the row is gone, tombstoned, owned by someone else, or
            // some other write landed. Either way this handle no longer
            // matches the store.
            state.released = true;
            Err(Error::new(ErrorKind::LockStolen))
        }
        Err(reread_error) => {
            log::warn!(
                "heartbeat reconciliation read for '{}' failed after an ambiguous write ({original}); leaving handle state unchanged: {reread_error}",
                handle.name()
            );
            Err(Error::new(ErrorKind::StoreUnavailable(original)))
        }
    }
}

/// Heartbeats `handle`, retrying up to `count` additional times with a fixed
/// `backoff` between attempts, but only on inconclusive errors — a
/// conclusive [`ErrorKind::LockStolen`] or [`ErrorKind::LockReleased`] is
/// never retried (spec §4.6 step 5).
///
/// # Errors
/// The error from the final attempt, if every attempt failed inconclusively,
/// or a conclusive error from the attempt that produced it.
pub(crate) async fn heartbeat_with_retries<S: StoreAdapter>(
    store: &S,
    table: TableRef<'_>,
    rvn_generator: &RvnGenerator,
    handle: &LockHandle,
    count: u32,
    backoff: Duration,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        let result = heartbeat(store, table, rvn_generator, handle, &HeartbeatOptions::default()).await;
        match result {
            Ok(()) => return Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::LockStolen | ErrorKind::LockReleased) => {
                return Err(e);
            }
            Err(e) if attempt >= count => return Err(e),
            Err(e) => {
                log::debug!(
                    "heartbeat retry {}/{count} for '{}' after inconclusive error: {e}",
                    attempt + 1,
                    handle.name()
                );
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
