// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Acquisition engine (spec §4.5, component C5): `Acquire(name, options)`.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::client::ClientOptions;
use crate::error::{Error, ErrorKind};
use crate::handle::LockHandle;
use crate::record::LockItem;
use crate::rvn::RvnGenerator;
use crate::store::{StoreAdapter, StoreError, TableRef, UpdateFields};

/// Options for [`crate::client::Client::acquire`].
#[derive(Clone, Debug)]
pub struct AcquireOptions {
    /// Payload to store with the lock.
    pub data: Vec<u8>,
    /// When re-acquiring a released tombstone, whether to overwrite its
    /// `data` with `data` above (`true`) or preserve the tombstone's
    /// existing payload (`false`).
    pub replace_data: bool,
    /// If set, `Release` will delete the row instead of tombstoning it.
    pub delete_on_release: bool,
    /// Bound on how long to keep polling a contested lock.
    /// `Duration::ZERO` means try once and fail immediately if contested.
    pub additional_time_to_wait_for_lock: Duration,
    /// Sleep between polls while a lock is contested.
    pub refresh_period: Duration,
    /// Fail immediately on the first observation that the lock is held
    /// (by anyone, including this client), rather than waiting.
    pub fail_if_locked: bool,
    /// Lease duration to apply to this acquisition; defaults to the
    /// client's configured default when `None`.
    pub lease_duration: Option<Duration>,
    /// Cancellation token threaded through every store call this attempt
    /// makes.
    pub cancellation: CancellationToken,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            replace_data: true,
            delete_on_release: false,
            additional_time_to_wait_for_lock: Duration::ZERO,
            refresh_period: Duration::from_millis(100),
            fail_if_locked: false,
            lease_duration: None,
            cancellation: CancellationToken::new(),
        }
    }
}

struct Observation {
    record_version_number: String,
    observed_at: Instant,
    lease_duration: Duration,
}

/// Sleeps `refresh_period` (capped by whatever of the poll budget remains)
/// and returns `Ok(())` so the caller can retry, or returns `on_exhausted`
/// if `deadline` has already passed.
///
/// This is how a transient (non-`ConditionalFailure`) store error is treated
/// as retryable within Acquire's poll budget (spec §7) rather than aborting
/// the whole call on the first flaky read or write.
async fn retry_or_fail(deadline: Instant, refresh_period: Duration, on_exhausted: Error) -> Result<(), Error> {
    let now = Instant::now();
    if now >= deadline {
        return Err(on_exhausted);
    }
    let remaining = deadline.saturating_duration_since(now);
    tokio::time::sleep(refresh_period.min(remaining)).await;
    Ok(())
}

/// Implements the Observe/Classify/Sleep/Deadline loop of spec §4.5.
///
/// # Errors
/// Returns [`ErrorKind::LockNotGranted`] if the deadline elapses while the
/// lock is contested, or [`ErrorKind::StoreUnavailable`] if a non-conditional
/// store error persists until the poll budget is exhausted.
pub(crate) async fn acquire<S: StoreAdapter>(
    store: &S,
    table: TableRef<'_>,
    rvn_generator: &RvnGenerator,
    client_options: &ClientOptions,
    name: String,
    options: AcquireOptions,
) -> Result<LockHandle, Error> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::LockNameLengthZero));
    }

    let lease_duration = options.lease_duration.unwrap_or(client_options.lease_duration);
    let deadline = Instant::now() + options.additional_time_to_wait_for_lock;
    let mut tracked: Option<Observation> = None;

    loop {
        if Instant::now() >= deadline && tracked.is_some() {
            return Err(Error::new(ErrorKind::LockNotGranted));
        }

        let observed = match store.get(table, &name, &options.cancellation).await {
            Ok(observed) => observed,
            Err(e) => {
                retry_or_fail(deadline, options.refresh_period, Error::new(ErrorKind::StoreUnavailable(e))).await?;
                continue;
            }
        };

        match observed {
            None => {
                let rvn = rvn_generator.next();
                let item = LockItem::new(
                    name.clone(),
                    client_options.owner_name.clone(),
                    rvn.clone(),
                    lease_duration,
                    options.data.clone(),
                );
                match store.put_if_absent(table, item, &options.cancellation).await {
                    Ok(()) => {
                        return Ok(LockHandle::new(
                            name,
                            client_options.owner_name.clone(),
                            rvn,
                            lease_duration,
                            options.data.clone(),
                            options.delete_on_release,
                        ));
                    }
                    Err(StoreError::ConditionalFailure) => continue,
                    Err(e) => {
                        retry_or_fail(deadline, options.refresh_period, Error::new(ErrorKind::StoreUnavailable(e))).await?;
                        continue;
                    }
                }
            }
            Some(item) if item.is_released => {
                let rvn = rvn_generator.next();
                let final_data = if options.replace_data {
                    options.data.clone()
                } else {
                    item.data.clone()
                };
                let fields = UpdateFields {
                    record_version_number: Some(rvn.clone()),
                    owner_name: Some(client_options.owner_name.clone()),
                    data: Some(final_data.clone()),
                    is_released: Some(false),
                    lease_duration_ms: Some(u64::try_from(lease_duration.as_millis()).unwrap_or(u64::MAX)),
                };
                match store
                    .update_if_rvn_matches(
                        table,
                        &name,
                        &item.record_version_number,
                        fields,
                        &options.cancellation,
                    )
                    .await
                {
                    Ok(()) => {
                        return Ok(LockHandle::new(
                            name,
                            client_options.owner_name.clone(),
                            rvn,
                            lease_duration,
                            final_data,
                            options.delete_on_release,
                        ));
                    }
                    Err(StoreError::ConditionalFailure) => continue,
                    Err(e) => {
                        retry_or_fail(deadline, options.refresh_period, Error::new(ErrorKind::StoreUnavailable(e))).await?;
                        continue;
                    }
                }
            }
            Some(item) => {
                // Held — by someone else, or by us; no reentrancy shortcut
                // (spec §4.5, §3.2 invariant 3).
                if options.fail_if_locked && tracked.is_none() {
                    return Err(Error::new(ErrorKind::LockNotGranted));
                }

                let unchanged = tracked
                    .as_ref()
                    .is_some_and(|t| t.record_version_number == item.record_version_number);

                if unchanged {
                    let t = tracked.as_ref().expect("checked by `unchanged`");
                    if t.observed_at.elapsed() >= t.lease_duration {
                        let rvn = rvn_generator.next();
                        let fields = UpdateFields {
                            record_version_number: Some(rvn.clone()),
                            owner_name: Some(client_options.owner_name.clone()),
                            data: Some(options.data.clone()),
                            is_released: Some(false),
                            lease_duration_ms: Some(
                                u64::try_from(lease_duration.as_millis()).unwrap_or(u64::MAX),
                            ),
                        };
                        match store
                            .update_if_rvn_matches(
                                table,
                                &name,
                                &item.record_version_number,
                                fields,
                                &options.cancellation,
                            )
                            .await
                        {
                            Ok(()) => {
                                log::info!("stole expired lock '{name}' from '{}'", item.owner_name);
                                return Ok(LockHandle::new(
                                    name,
                                    client_options.owner_name.clone(),
                                    rvn,
                                    lease_duration,
                                    options.data.clone(),
                                    options.delete_on_release,
                                ));
                            }
                            Err(StoreError::ConditionalFailure) => {
                                tracked = None;
                                continue;
                            }
                            Err(e) => {
                                retry_or_fail(deadline, options.refresh_period, Error::new(ErrorKind::StoreUnavailable(e))).await?;
                                continue;
                            }
                        }
                    }
                } else {
                    tracked = Some(Observation {
                        record_version_number: item.record_version_number.clone(),
                        observed_at: Instant::now(),
                        lease_duration: item.lease_duration,
                    });
                }

                if Instant::now() >= deadline {
                    return Err(Error::new(ErrorKind::LockNotGranted));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(options.refresh_period.min(remaining)).await;
            }
        }
    }
}
