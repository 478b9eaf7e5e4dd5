// Licensed under the MIT License.

use std::time::Duration;

use dlm_core::store::memory::InMemoryStore;
use dlm_core::{LockParamsBuilder, Session};
use env_logger::Builder;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    let session = Session::new("demo-table", InMemoryStore::new());

    let params = LockParamsBuilder::default()
        .lease(Duration::from_secs(10))
        .refresh_period(Duration::from_secs(3))
        .acquire_timeout(Some(Duration::from_secs(5)))
        .build()
        .unwrap();
    let handle = session.create_lock("leader-election", params);

    match handle.acquire().await {
        Ok(()) => log::info!("acquired lock {:?}", handle.name()),
        Err(e) => {
            log::error!("failed acquiring lock: {e}");
            return;
        }
    }

    log::info!("doing work while holding the lock");

    match handle.serialize().await {
        Ok(token) => log::info!("lock handed off as: {token}"),
        Err(e) => log::error!("failed serializing lock: {e}"),
    }

    handle.release().await;
    log::info!("released lock {:?}", handle.name());

    session.close().await;
}
