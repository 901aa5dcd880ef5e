use std::sync::Arc;
use std::time::Duration;

use streamgate_core::StreamCoordinator;
use tracing::info;

/// Periodic sweep that tears down idle streams past their max age. Never touches a stream
/// currently `downloading` or `converting` — `Registry::list_older_than` already excludes
/// those — so a slow-but-healthy download is never swept out from under it.
pub async fn run(coordinator: Arc<StreamCoordinator>, interval: Duration, max_age: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it so startup isn't penalized

    loop {
        ticker.tick().await;
        let stale = coordinator.registry().list_older_than(max_age);
        if stale.is_empty() {
            continue;
        }
        info!(count = stale.len(), "janitor sweeping stale streams");
        for stream in stale {
            coordinator.cancel_stream(stream.id).await;
        }
    }
}
