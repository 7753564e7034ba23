// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A distributed advisory lock client built on an abstract conditional
//! key-value store.
//!
//! The client never talks to a network itself; it depends only on the
//! [`StoreAdapter`] trait's strongly-consistent read and three conditional
//! writes. Correctness comes entirely from chaining record version numbers
//! through those conditional writes — this crate never compares two RVN
//! values to decide which is "newer".
//!
//! ```no_run
//! # use std::time::Duration;
//! # use advisory_lock::{Client, ClientOptionsBuilder, memory_store::MemoryStore};
//! # async fn run() -> Result<(), advisory_lock::Error> {
//! let store = MemoryStore::new();
//! let options = ClientOptionsBuilder::default()
//!     .lease_duration(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//! let client = Client::new(store, "lockTable", options)?;
//!
//! let handle = client.acquire("my-lock", Default::default()).await?;
//! client.heartbeat(&handle, Default::default()).await?;
//! client.release(&handle, Default::default()).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod acquire;
mod client;
mod error;
mod handle;
mod heartbeat;
pub mod memory_store;
mod record;
mod release;
mod rvn;
mod store;

pub use acquire::AcquireOptions;
pub use client::{Client, ClientOptions, ClientOptionsBuilder, ClientOptionsBuilderError};
pub use error::{Error, ErrorKind};
pub use handle::LockHandle;
pub use heartbeat::HeartbeatOptions;
pub use record::{CodecError, LockItem};
pub use release::ReleaseOptions;
pub use rvn::RvnGenerator;
pub use store::{StoreAdapter, StoreError, TableRef, UpdateFields};
