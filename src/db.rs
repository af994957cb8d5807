mod migration;
mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::warn;

use crate::config::RetryPolicy;
use crate::retry::retry_on_busy;
use crate::{OriginId, StoreError};

pub use migration::{MIGRATIONS, Migration, current_version};
pub use schema::EXPECTED_TABLES;
use schema::ACTOR_IDENTITY_INDEX;

/// How long SQLite itself waits on a lock before reporting SQLITE_BUSY.
///
/// Kept short: longer waits are handled by [`retry_on_busy`] with jitter.
const BUSY_TIMEOUT: Duration = Duration::from_millis(50);

/// Database wrapper providing connection management and schema initialization.
///
/// One `Database` wraps one connection. Concurrent ingestion opens one `Database` per
/// worker thread on the same file.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens an in-memory SQLite database.
    ///
    /// Automatically initializes the schema on connection open.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    /// Opens a file-based SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist.
    /// Automatically initializes the schema on connection open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open database: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::initialize(conn)
    }

    /// Enables foreign keys, applies pending migrations and tries to create the
    /// actor identity index.
    fn initialize(mut conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migration::apply_pending_migrations(&mut conn).context("apply migrations")?;

        let db = Self { conn };
        db.ensure_actor_identity_index()?;
        Ok(db)
    }

    /// Creates the unique (origin, oid) index on actors when possible.
    ///
    /// Returns `Ok(false)` when duplicate actors still exist; the index is retried after
    /// the next merge pass.
    pub fn ensure_actor_identity_index(&self) -> Result<bool, StoreError> {
        match self.conn.execute_batch(ACTOR_IDENTITY_INDEX) {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                warn!(
                    detail = msg.as_deref().unwrap_or(""),
                    "duplicate actor identities present, unique index deferred until merge"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn actor_identity_index_exists(&self) -> Result<bool, StoreError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='index' AND name='idx_actors_origin_oid')",
            [],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Starts an IMMEDIATE transaction so the write lock is taken up front and lock
    /// contention surfaces as SQLITE_BUSY before any work is done.
    pub fn begin_immediate(&self) -> Result<Transaction<'_>, StoreError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Runs `f` inside one IMMEDIATE transaction, retrying the whole unit while the store
    /// is busy. The transaction rolls back when `f` fails.
    pub fn write<F, T>(&self, policy: &RetryPolicy, what: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> Result<T, StoreError>,
    {
        retry_on_busy(policy, what, || {
            let tx = self.begin_immediate()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Returns the id of the named origin, creating it when absent.
    pub fn ensure_origin(&self, name: &str) -> Result<OriginId, StoreError> {
        self.conn.execute(
            "INSERT INTO origins (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            [name],
        )?;
        let id = self
            .conn
            .query_row("SELECT id FROM origins WHERE name = ?1", [name], |row| {
                row.get(0)
            })?;
        Ok(OriginId::new(id))
    }
}
