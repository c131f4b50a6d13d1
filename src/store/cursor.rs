use std::path::Path;

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

use crate::monitor::TransactionLocation;

/// One row per monitor: the location of the last fully processed event.
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let pool = super::open_pool(path).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS monitor_locations ( \
             monitor TEXT PRIMARY KEY, \
             block_hash TEXT NOT NULL, \
             tx_id TEXT NOT NULL, \
             updated_at TEXT NOT NULL DEFAULT (datetime('now')) \
             )",
        )
        .execute(&pool)
        .await?;
        info!(path = %path.display(), "opened cursor store");
        Ok(Self { pool })
    }

    pub async fn load(&self, monitor: &str) -> Result<Option<TransactionLocation>, sqlx::Error> {
        let row = sqlx::query("SELECT block_hash, tx_id FROM monitor_locations WHERE monitor = ?1")
            .bind(monitor)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| TransactionLocation {
            block_hash: row.get(0),
            tx_id: row.get(1),
        }))
    }

    pub async fn save(
        &self,
        monitor: &str,
        location: &TransactionLocation,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO monitor_locations (monitor, block_hash, tx_id) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(monitor) DO UPDATE SET \
             block_hash = excluded.block_hash, \
             tx_id = excluded.tx_id, \
             updated_at = datetime('now')",
        )
        .bind(monitor)
        .bind(&location.block_hash)
        .bind(&location.tx_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
