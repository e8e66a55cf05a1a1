//! parley-directory — rendezvous service for parley clients.

use anyhow::{Context, Result};

use parley_core::config::DirectoryConfig;
use parley_directory::registry::{sweep_loop, ExpiringRegistry};
use parley_directory::{api, ApiState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DirectoryConfig::from_env().context("failed to read directory config")?;
    let registry = ExpiringRegistry::new();

    let sweep_task = tokio::spawn(sweep_loop(registry.clone()));

    let state = ApiState { registry };
    tokio::select! {
        r = api::serve(state, config.port) => {
            if let Err(e) = r {
                tracing::error!(error = %e, "directory server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    sweep_task.abort();
    Ok(())
}
