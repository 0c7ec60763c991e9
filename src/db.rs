//! Schema management and connection setup for the SQLite metadata database.

use sqlx::{
    Connection, Sqlite, SqliteConnection, Transaction,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::time::Duration;

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// How long a connection waits for the write lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by every pooled connection to a metadata database file.
///
/// WAL lets readers proceed while a writer holds the lock.
pub fn connect_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Open a write transaction on `conn`.
///
/// At top level this is `BEGIN IMMEDIATE`, so the write lock is taken up
/// front and competing writers queue on the busy timeout. Inside an open
/// transaction it nests as a savepoint.
pub async fn begin_write(conn: &mut SqliteConnection) -> sqlx::Result<Transaction<'_, Sqlite>> {
    if conn.is_in_transaction() {
        conn.begin().await
    } else {
        conn.begin_with("BEGIN IMMEDIATE").await
    }
}

/// Apply the embedded schema statement by statement.
///
/// Every statement is `IF NOT EXISTS`, so running this on an initialised
/// database is a no-op.
pub async fn run_migrations(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&mut *conn).await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_connection() -> SqliteConnection {
    let mut conn = SqliteConnection::connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    run_migrations(&mut conn).await.expect("apply schema");
    conn
}
