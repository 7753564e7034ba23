// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Release engine (spec §4.7, component C7): `Release(handle, options)`.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind};
use crate::handle::LockHandle;
use crate::rvn::RvnGenerator;
use crate::store::{StoreAdapter, StoreError, TableRef};

/// Options for [`crate::client::Client::release`].
#[derive(Clone, Debug)]
pub struct ReleaseOptions {
    /// New payload to tombstone the row with (spec §4.7
    /// `data=newData?`). `None` leaves the row's current `data` untouched.
    /// Ignored when the handle was acquired with `delete_on_release`, since
    /// the row is deleted outright rather than tombstoned.
    pub data: Option<Vec<u8>>,
    /// Cancellation token threaded through the store call this release
    /// makes.
    pub cancellation: CancellationToken,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self {
            data: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Releases `handle`, deleting or tombstoning its row depending on the
/// `delete_on_release` choice made at acquisition time.
///
/// Always terminal: `handle` is marked released whether the store confirms
/// success, reports the precondition already failed, or returns an
/// inconclusive error (spec §4.7, §3.2 invariant 5 — a handle never re-enters
/// the held state once released).
///
/// # Errors
/// Returns [`ErrorKind::LockAlreadyReleased`] if `handle` was already
/// released locally, or if the store reports the row was already gone or
/// changed by another write. Returns [`ErrorKind::StoreUnavailable`] if the
/// store call itself failed inconclusively; the handle is still marked
/// released in this case.
pub(crate) async fn release<S: StoreAdapter>(
    store: &S,
    table: TableRef<'_>,
    rvn_generator: &RvnGenerator,
    handle: &LockHandle,
    options: ReleaseOptions,
) -> Result<(), Error> {
    let mut state = handle.lock().await;
    if state.released {
        return Err(Error::new(ErrorKind::LockAlreadyReleased));
    }

    let result = if handle.delete_on_release() {
        store
            .delete_if_rvn_matches(
                table,
                handle.name(),
                &state.record_version_number,
                &options.cancellation,
            )
            .await
    } else {
        // Chains a fresh RVN onto the tombstone so the persisted RVN
        // sequence keeps advancing even on release (spec §8 invariant 2).
        let tombstone_rvn = rvn_generator.next();
        let result = store
            .update_if_rvn_matches(
                table,
                handle.name(),
                &state.record_version_number,
                crate::store::UpdateFields {
                    record_version_number: Some(tombstone_rvn.clone()),
                    is_released: Some(true),
                    data: options.data.clone(),
                    ..crate::store::UpdateFields::default()
                },
                &options.cancellation,
            )
            .await;
        if result.is_ok() {
            state.record_version_number = tombstone_rvn;
            if let Some(data) = &options.data {
                state.data.clone_from(data);
            }
        }
        result
    };

    state.released = true;

    match result {
        Ok(()) => Ok(()),
        Err(StoreError::ConditionalFailure) => Err(Error::new(ErrorKind::LockAlreadyReleased)),
        Err(e) => {
            log::warn!(
                "release of '{}' returned an inconclusive store error; handle is marked released regardless: {e}",
                handle.name()
            );
            Err(Error::new(ErrorKind::StoreUnavailable(e)))
        }
    }
}
