use std::path::Path;

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

/// Chain a source event originated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    NineChronicles,
    Ethereum,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::NineChronicles => "nineChronicles",
            Network::Ethereum => "ethereum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// The principal exchange leg of a source event.
    Exchange,
    /// A partial or full return of funds to the original sender.
    Refund,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Exchange => "exchange",
            RecordKind::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Emitted,
    Refunded,
    Rejected,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Emitted => "emitted",
            RecordStatus::Refunded => "refunded",
            RecordStatus::Rejected => "rejected",
        }
    }
}

/// Durable evidence that a source event was observed and what was done
/// about it. The unique key over `(network, tx_id, log_index, kind)` is
/// what makes processing exactly-once across restarts: a present exchange
/// leg means "do not re-emit".
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub network: Network,
    pub tx_id: String,
    pub log_index: u32,
    pub kind: RecordKind,
    pub sender: String,
    pub recipient: String,
    /// Decimal NCG, like `sent`; both columns share one unit so terminal
    /// records reconcile as `requested = sent + fee + refund`.
    pub requested: String,
    pub sent: String,
    /// Exact 18-decimal base units of the source event, for rows whose
    /// source amount was scaled down to NCG precision (burns).
    pub requested_base_units: Option<String>,
    pub status: RecordStatus,
}

pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let pool = super::open_pool(path).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS exchange_histories ( \
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             network TEXT NOT NULL, \
             tx_id TEXT NOT NULL, \
             log_index INTEGER NOT NULL DEFAULT 0, \
             kind TEXT NOT NULL, \
             sender TEXT NOT NULL, \
             recipient TEXT NOT NULL, \
             requested TEXT NOT NULL, \
             sent TEXT NOT NULL, \
             requested_base_units TEXT, \
             counter_tx_id TEXT, \
             status TEXT NOT NULL, \
             created_at TEXT NOT NULL DEFAULT (datetime('now')), \
             UNIQUE (network, tx_id, log_index, kind) \
             )",
        )
        .execute(&pool)
        .await?;
        info!(path = %path.display(), "opened exchange history store");
        Ok(Self { pool })
    }

    /// Whether the principal leg for this source event was already
    /// recorded, regardless of how it ended.
    pub async fn exists(
        &self,
        network: Network,
        tx_id: &str,
        log_index: u32,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT 1 FROM exchange_histories \
             WHERE network = ?1 AND tx_id = ?2 AND log_index = ?3 AND kind = ?4",
        )
        .bind(network.as_str())
        .bind(tx_id)
        .bind(i64::from(log_index))
        .bind(RecordKind::Exchange.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn insert(&self, record: &HistoryRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO exchange_histories \
             (network, tx_id, log_index, kind, sender, recipient, requested, sent, \
             requested_base_units, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(record.network.as_str())
        .bind(&record.tx_id)
        .bind(i64::from(record.log_index))
        .bind(record.kind.as_str())
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(&record.requested)
        .bind(&record.sent)
        .bind(&record.requested_base_units)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fills in the counter-chain transaction once the emission went out.
    pub async fn attach_counter_tx(
        &self,
        network: Network,
        tx_id: &str,
        log_index: u32,
        kind: RecordKind,
        counter_tx_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE exchange_histories SET counter_tx_id = ?5 \
             WHERE network = ?1 AND tx_id = ?2 AND log_index = ?3 AND kind = ?4",
        )
        .bind(network.as_str())
        .bind(tx_id)
        .bind(i64::from(log_index))
        .bind(kind.as_str())
        .bind(counter_tx_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn amounts(
        &self,
        network: Network,
        tx_id: &str,
        kind: RecordKind,
    ) -> Result<(String, String, Option<String>), sqlx::Error> {
        let row = sqlx::query(
            "SELECT requested, sent, requested_base_units FROM exchange_histories \
             WHERE network = ?1 AND tx_id = ?2 AND kind = ?3",
        )
        .bind(network.as_str())
        .bind(tx_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get(0), row.get(1), row.get(2)))
    }

    #[cfg(test)]
    async fn counter_tx(
        &self,
        network: Network,
        tx_id: &str,
        kind: RecordKind,
    ) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT counter_tx_id FROM exchange_histories \
             WHERE network = ?1 AND tx_id = ?2 AND kind = ?3",
        )
        .bind(network.as_str())
        .bind(tx_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }
}
