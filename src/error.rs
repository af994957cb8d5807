//! Errors raised by the ingestion engine and its consistency passes.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::{ActorId, NoteId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Any error reported by SQLite.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store stayed busy or locked for every retry attempt.
    #[error("store busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// The activity lacks data required to persist it.
    #[error("malformed activity {oid}: {reason}")]
    MalformedActivity { oid: String, reason: String },

    /// The activity verb is not handled by the materializer.
    #[error("unsupported activity type: {0}")]
    UnsupportedActivity(String),

    #[error("actor {0} not found")]
    ActorNotFound(ActorId),

    #[error("note {0} not found")]
    NoteNotFound(NoteId),
}

impl StoreError {
    pub fn malformed(oid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedActivity {
            oid: oid.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for transient lock contention that is worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Returns `true` when SQLite reported a table or column this schema version lacks.
    pub(crate) fn is_missing_schema_object(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(_, Some(msg))) => {
                msg.contains("no such table") || msg.contains("no such column")
            }
            _ => false,
        }
    }
}
