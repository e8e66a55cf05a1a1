//! parley-client — peer-to-peer chat client.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use parley_core::config::ClientConfig;
use parley_core::user::user_id;
use parley_core::User;

use parley_client::directory::DirectoryClient;
use parley_client::socket::{self, SocketManager};
use parley_client::store::Store;
use parley_client::sync;
use parley_client::tui::Tui;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env().context("failed to read client config")?;

    let listener = socket::bind_listen_port()
        .await
        .context("failed to allocate a listen port")?;
    let port = listener.local_addr().context("listener address")?.port();
    let address = socket::local_ipv4().context("failed to discover the local address")?;

    let current_user = User {
        id: user_id(&address, port),
        name: config.user_name.clone(),
        address,
        port,
    };
    tracing::info!(id = %current_user.id, addr = %current_user.address, port, "client identity ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Store::new(current_user, shutdown_rx.clone());
    let manager = SocketManager::new(listener, store.clone())?;
    let accept_task = manager.start(shutdown_rx.clone()).await;

    let directory = DirectoryClient::new(config.server_url.clone());

    // warm-up pass so the UI starts with a populated roster
    sync::sync_once(&directory, &store).await;
    let sync_task = tokio::spawn(sync::sync_loop(directory, store.clone(), shutdown_rx.clone()));

    let tui = Tui::new(store.clone());
    let ui_shutdown = shutdown_rx.clone();
    let ui_result = tokio::task::spawn_blocking(move || tui.run(ui_shutdown))
        .await
        .context("UI task panicked")?;
    if let Err(e) = ui_result {
        tracing::error!(error = %e, "terminal UI failed");
    }

    // UI is gone: tear everything down and give the tasks a moment to unwind
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        let _ = sync_task.await;
        let _ = accept_task.await;
    })
    .await;

    tracing::info!("bye");
    Ok(())
}
