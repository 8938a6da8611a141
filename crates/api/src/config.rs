//! Server configuration

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooler) URL used for migrations.
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    /// Bearer token required on every /admin route.
    pub operator_token: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            operator_token: std::env::var("OPERATOR_TOKEN")
                .context("OPERATOR_TOKEN must be set")?,
        })
    }
}
