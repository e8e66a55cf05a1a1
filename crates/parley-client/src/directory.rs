//! HTTP client for the directory service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use parley_core::User;

/// Per-request timeout for directory calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Register or refresh the given user's record.
    pub async fn ping(&self, user: &User) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/ping", self.base_url))
            .timeout(HTTP_TIMEOUT)
            .json(user)
            .send()
            .await
            .with_context(|| format!("failed to reach the directory at {}", self.base_url))?;

        if !response.status().is_success() {
            bail!("non 2xx http status: {}", response.status().as_u16());
        }
        Ok(())
    }

    /// The directory's current snapshot of live clients.
    pub async fn clients(&self) -> Result<Vec<User>> {
        #[derive(Deserialize)]
        struct ClientsResponse {
            clients: Vec<User>,
        }

        let response = self
            .http
            .get(format!("{}/clients", self.base_url))
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("failed to reach the directory at {}", self.base_url))?;

        if !response.status().is_success() {
            bail!("non 2xx http status: {}", response.status().as_u16());
        }

        let body: ClientsResponse = response
            .json()
            .await
            .context("failed to parse the clients response")?;
        Ok(body.clients)
    }
}
