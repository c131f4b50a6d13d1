//! The two embedded stores backing restart safety: monitor cursors and
//! the exchange history. Both are single-writer SQLite files opened with
//! full synchronous commits so a record that was reported written survives
//! a crash.

use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

pub mod cursor;
pub mod history;

pub use cursor::CursorStore;
pub use history::{HistoryRecord, HistoryStore, Network, RecordKind, RecordStatus};

async fn open_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}
