// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the advisory lock client.

use thiserror::Error;

use crate::store::StoreError;

/// Represents an error that occurred while using the advisory lock client.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorKind);

impl Error {
    /// Returns the [`ErrorKind`] of the error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self(kind)
    }
}

/// Represents the kinds of errors that occur in the advisory lock client.
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// `Acquire` exhausted its poll budget without obtaining the lock.
    #[error("lock not granted within the requested wait duration")]
    LockNotGranted,
    /// A conditional write on a held handle failed because another client's write won the race.
    #[error("lock was stolen by another holder")]
    LockStolen,
    /// An operation was attempted on a handle that is already released.
    #[error("handle has already been released")]
    LockReleased,
    /// `Release` was called on a handle that was already released or lost; non-fatal.
    #[error("lock was already released")]
    LockAlreadyReleased,
    /// The underlying store returned an error that is not a conditional failure.
    #[error("store adapter error: {0}")]
    StoreUnavailable(#[from] StoreError),
    /// A lock name must not be empty.
    #[error("lock name length must not be zero")]
    LockNameLengthZero,
    /// An owner/holder identity must not be empty.
    #[error("owner name length must not be zero")]
    OwnerNameLengthZero,
    /// A table name must not be empty.
    #[error("table name length must not be zero")]
    TableNameLengthZero,
    /// An argument supplied to an operation was invalid.
    #[error("{0}")]
    InvalidArgument(String),
}
