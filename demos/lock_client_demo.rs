// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use advisory_lock::memory_store::MemoryStore;
use advisory_lock::{AcquireOptions, Client, ClientOptionsBuilder};
use env_logger::Builder;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    let store = MemoryStore::new();
    let options = ClientOptionsBuilder::default()
        .lease_duration(Duration::from_secs(10))
        .owner_name("lockHolder")
        .heartbeat_period(Duration::from_secs(3))
        .build()
        .unwrap();
    let client = Client::new(store, "lockTable", options).unwrap();

    lock_operations(&client).await;

    client.close().await.unwrap();
}

async fn lock_operations(client: &Client<MemoryStore>) {
    let lock_key = "lockKey1";

    let handle = match client
        .acquire(
            lock_key,
            AcquireOptions {
                additional_time_to_wait_for_lock: Duration::from_secs(10),
                ..AcquireOptions::default()
            },
        )
        .await
    {
        Ok(handle) => {
            log::info!("lock acquired successfully");
            handle
        }
        Err(e) => {
            log::error!("failed acquiring lock: {e}");
            return;
        }
    };

    log::info!(
        "holder='{}' rvn='{}'",
        handle.owner_name(),
        handle.record_version_number().await
    );

    if let Err(e) = client.heartbeat(&handle, Default::default()).await {
        log::error!("failed heartbeating lock: {e}");
        return;
    }
    log::info!("heartbeat succeeded, rvn='{}'", handle.record_version_number().await);

    match client.release(&handle, Default::default()).await {
        Ok(()) => log::info!("lock released successfully"),
        Err(e) => log::error!("failed releasing lock: {e}"),
    }
}
