// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generates record version numbers (RVNs).
//!
//! An RVN only needs to be (a) globally unlikely to collide across clients
//! and (b) distinct from any token this generator has previously produced.
//! Correctness of the lock protocol never depends on comparing two RVNs'
//! values — only on chaining them through conditional writes — so the
//! timestamp prefix below exists purely so a human reading a table dump or a
//! log line can eyeball roughly when a row was last written.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::RngCore;

/// Produces fresh RVN tokens.
///
/// Safe to share across tasks: the monotonic counter is updated atomically,
/// and entropy is drawn from the thread-local CSPRNG on each call.
pub struct RvnGenerator {
    sequence: AtomicU32,
}

impl Default for RvnGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RvnGenerator {
    /// Creates a new generator. Typically one per [`crate::client::Client`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    /// Mints a new, opaque RVN token.
    ///
    /// Callers must treat the returned string as opaque; do not parse it to
    /// establish ordering between two tokens.
    #[must_use]
    pub fn next(&self) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut entropy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut entropy);
        let entropy_hex = data_encoding::HEXUPPER.encode(&entropy);

        format!("{millis:x}-{sequence:08x}-{entropy_hex}")
    }
}
