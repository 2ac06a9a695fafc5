// src/state_manager.rs

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// What the HTTP transport needs to pick a transfer up again after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: u64,
    pub url: String,
    pub partial_path: PathBuf,
    pub bytes_received: u64,
    /// 0 when unknown.
    pub bytes_expected: u64,
}

/// Persists transfer records to an SQLite database.
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Connects to the database file, creating it and the table if needed.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS transfers (
                        id              INTEGER PRIMARY KEY,
                        record_data     TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces a record.
    pub async fn save_record(&self, record: &TransferRecord) -> Result<(), StateError> {
        let record_data = serde_json::to_string(record)?;
        let id = record.id as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO transfers (id, record_data) VALUES (?1, ?2)",
                    params![id, record_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads every record, ordered by id.
    pub async fn load_all_records(&self) -> Result<Vec<TransferRecord>, StateError> {
        let records = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record_data FROM transfers ORDER BY id")?;
                let rows = stmt.query_map([], |row| {
                    let record_data: String = row.get(0)?;
                    serde_json::from_str::<TransferRecord>(&record_data).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                    })
                })?;
                let records = rows.collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    pub async fn delete_record(&self, id: u64) -> Result<(), StateError> {
        let id = id as i64;
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM transfers WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
