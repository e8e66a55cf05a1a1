//! Directory sync — keeps the local roster consistent with the directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::directory::DirectoryClient;
use crate::store::Store;

/// How often the client re-registers and re-reads the peer list.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// One sync pass: heartbeat, then reconcile the store against the snapshot.
/// Failures are logged; the next pass retries.
pub async fn sync_once(directory: &DirectoryClient, store: &Store) {
    if let Err(e) = directory.ping(store.current_user()).await {
        tracing::warn!(error = %e, "failed to ping directory");
    }

    match directory.clients().await {
        Ok(users) => {
            if let Err(e) = store.refresh_users(users) {
                tracing::warn!(error = %e, "failed to refresh store users");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to get clients from directory");
        }
    }
}

/// Run [`sync_once`] every [`SYNC_INTERVAL`] until shutdown. Callers run the
/// warm-up pass themselves so the UI starts with a populated roster.
pub async fn sync_loop(
    directory: DirectoryClient,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + SYNC_INTERVAL;
    let mut interval = tokio::time::interval_at(start, SYNC_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!("directory sync stopping");
                return;
            }
            _ = interval.tick() => sync_once(&directory, &store).await,
        }
    }
}
