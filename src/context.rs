use crate::config::SyncConfig;
use crate::database::{Database, PostgresStore};
use crate::http_client::build_async_client;
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide settings shared by every command.
#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
    config: SyncConfig,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            database_url,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed sync commands."
            ));
        };
        Database::new(database_url).await
    }

    /// Connects and makes sure the target tables exist.
    pub async fn target_store(&self) -> Result<PostgresStore> {
        let db = self.database().await?;
        db.ensure_schema().await?;
        Ok(PostgresStore::new(db, self.config.dividend_target))
    }

    pub fn http_client(&self) -> Result<Client> {
        build_async_client(Some(HTTP_TIMEOUT))
    }
}
