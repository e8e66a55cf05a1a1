//! Environment-driven configuration.
//!
//! The client requires `USER_NAME` and `SERVER_URL`; the directory accepts an
//! optional `DIRECTORY_PORT`. Both binaries read `RUST_LOG` through the
//! tracing env filter.

/// Default HTTP listen port for the directory.
pub const DEFAULT_DIRECTORY_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing {0} env var")]
    MissingVar(&'static str),
    #[error("invalid {0} env var: {1}")]
    InvalidVar(&'static str, String),
}

/// Client configuration. Both variables are required and must be non-empty
/// after whitespace trim.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_name: String,
    /// Directory base URL, stored without a trailing slash.
    pub server_url: String,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_name = require("USER_NAME")?;
        let server_url = require("SERVER_URL")?.trim_end_matches('/').to_string();
        Ok(Self {
            user_name,
            server_url,
        })
    }
}

/// Directory configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub port: u16,
}

impl DirectoryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("DIRECTORY_PORT") {
            Ok(v) => v
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidVar("DIRECTORY_PORT", v.clone()))?,
            Err(_) => DEFAULT_DIRECTORY_PORT,
        };
        Ok(Self { port })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    let value = std::env::var(key).unwrap_or_default();
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::MissingVar(key));
    }
    Ok(value.to_string())
}
