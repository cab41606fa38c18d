//! ClickHouse state store for the active quoting engine.
//!
//! Provides a type-safe interface for batch inserts and schema management.
//! Durable state covers positions, fills, markout samples, sessions, and
//! the append-only event ledger.

use chrono::Utc;
use clickhouse::Client;
use thiserror::Error;

use crate::{FillRow, LedgerRow, MarkoutRow, PositionRow, SessionRow};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store client error: {0}")]
    Client(#[from] clickhouse::error::Error),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("schema creation failed: {0}")]
    Schema(String),
}

/// Configuration for the state store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// ClickHouse HTTP URL (e.g., "http://localhost:8123").
    pub url: String,
    /// Database name.
    pub database: String,
    /// Username (optional).
    pub user: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "quoter".to_string(),
            user: None,
            password: None,
        }
    }
}

/// State store wrapper with typed batch inserts.
#[derive(Clone)]
pub struct StateStore {
    client: Client,
}

impl StateStore {
    /// Creates a new state store with the given configuration.
    pub fn new(config: StoreConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        Self { client }
    }

    /// Creates a store with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(StoreConfig::default())
    }

    /// Returns a reference to the underlying client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Tests the connection by running a simple query.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Creates all required tables using the embedded schema.
    pub async fn create_tables(&self) -> Result<(), StoreError> {
        let schema = include_str!("schema.sql");

        for statement in schema.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }

            let non_comment_lines: Vec<&str> = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--") && !line.trim().is_empty())
                .collect();

            if non_comment_lines.is_empty() {
                continue;
            }

            self.client
                .query(statement)
                .execute()
                .await
                .map_err(|e| StoreError::Schema(format!("{}: {}", e, statement)))?;
        }

        Ok(())
    }

    /// Writes a batch of position snapshots.
    pub async fn insert_positions(&self, rows: &[PositionRow]) -> Result<(), StoreError> {
        self.insert_batch("positions", rows).await
    }

    /// Writes a batch of fills.
    pub async fn insert_fills(&self, rows: &[FillRow]) -> Result<(), StoreError> {
        self.insert_batch("fills", rows).await
    }

    /// Writes a batch of markout samples.
    pub async fn insert_markouts(&self, rows: &[MarkoutRow]) -> Result<(), StoreError> {
        self.insert_batch("markouts", rows).await
    }

    /// Writes a batch of ledger events.
    pub async fn insert_events(&self, rows: &[LedgerRow]) -> Result<(), StoreError> {
        self.insert_batch("events", rows).await
    }

    /// Writes a session record. Called once at startup with status
    /// "running", then again at shutdown with the final status; the
    /// ReplacingMergeTree keeps the latest row per session_id.
    pub async fn write_session(&self, session: &SessionRow) -> Result<(), StoreError> {
        self.insert_batch("sessions", std::slice::from_ref(session))
            .await
    }

    /// Finalizes a session with the given status.
    pub async fn finalize_session(
        &self,
        session: &SessionRow,
        status: &str,
    ) -> Result<(), StoreError> {
        let finished = SessionRow {
            ended_at: Utc::now(),
            status: status.to_string(),
            ..session.clone()
        };
        self.write_session(&finished).await
    }

    /// Loads the latest position snapshot per token.
    pub async fn fetch_positions(&self) -> Result<Vec<PositionRow>, StoreError> {
        let rows = self
            .client
            .query("SELECT token_id, size, avg_price, updated_at FROM positions FINAL")
            .fetch_all::<PositionRow>()
            .await?;
        Ok(rows)
    }

    async fn insert_batch<T>(&self, table: &str, rows: &[T]) -> Result<(), StoreError>
    where
        T: clickhouse::Row + serde::Serialize,
    {
        if rows.is_empty() {
            return Ok(());
        }

        let mut insert = self.client.insert(table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.database, "quoter");
        assert!(config.user.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_store_creation() {
        let config = StoreConfig {
            url: "http://clickhouse:8123".to_string(),
            database: "test".to_string(),
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
        };
        let _store = StateStore::new(config);
        // Client creation should not panic
    }

    #[test]
    fn test_store_with_defaults() {
        let _store = StateStore::with_defaults();
    }

    #[test]
    fn test_schema_has_all_tables() {
        let schema = include_str!("schema.sql");
        for table in ["positions", "fills", "markouts", "sessions", "events"] {
            assert!(
                schema.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)),
                "missing table {}",
                table
            );
        }
    }
}
