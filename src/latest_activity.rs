//! Per-actor "latest activity" index.
//!
//! Ingestion records every activity it sees into memory; [`LatestActivityIndex::flush`]
//! persists the per-actor maxima once per batch.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::{ActivityId, ActorId, Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestActivity {
    pub activity_id: ActivityId,
    pub activity_date: i64,
}

#[derive(Debug, Default)]
pub struct LatestActivityIndex {
    pending: HashMap<ActorId, LatestActivity>,
}

impl LatestActivityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the newest activity seen for `actor` during this batch.
    pub fn record_activity(&mut self, actor: ActorId, activity_id: ActivityId, activity_date: i64) {
        self.pending
            .entry(actor)
            .and_modify(|latest| {
                if activity_date > latest.activity_date {
                    *latest = LatestActivity {
                        activity_id,
                        activity_date,
                    };
                }
            })
            .or_insert(LatestActivity {
                activity_id,
                activity_date,
            });
    }

    pub fn pending(&self, actor: ActorId) -> Option<LatestActivity> {
        self.pending.get(&actor).copied()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Persists accumulated entries and clears them. Returns the number of actors whose
    /// stored value advanced.
    ///
    /// Each entry is compared against the value stored right now, so a concurrent writer
    /// that already advanced it is never rolled back. Entries stay pending when the
    /// store could not be written.
    pub fn flush(&mut self, db: &Database, retry: &RetryPolicy) -> Result<usize, StoreError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let entries: Vec<(ActorId, LatestActivity)> =
            self.pending.iter().map(|(k, v)| (*k, *v)).collect();

        let advanced = db.write(retry, "flush_latest_activity", |conn| {
            let mut advanced = 0;
            for (actor, latest) in &entries {
                if persist_if_newer(conn, *actor, *latest)? {
                    advanced += 1;
                }
            }
            Ok(advanced)
        });

        match advanced {
            Ok(advanced) => {
                debug!(entries = entries.len(), advanced, "flushed latest activity index");
                self.pending.clear();
                Ok(advanced)
            }
            Err(e) => {
                warn!(entries = entries.len(), "latest activity flush failed: {e}");
                Err(e)
            }
        }
    }
}

fn persist_if_newer(
    conn: &Connection,
    actor: ActorId,
    latest: LatestActivity,
) -> Result<bool, StoreError> {
    let stored: Option<i64> = conn
        .query_row(
            "SELECT actor_activity_date FROM actors WHERE id = ?1",
            [actor.get()],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        Some(date) if latest.activity_date > date => {
            conn.execute(
                "UPDATE actors SET actor_activity_id = ?1, actor_activity_date = ?2
                 WHERE id = ?3 AND actor_activity_date < ?2",
                params![latest.activity_id.get(), latest.activity_date, actor.get()],
            )?;
            Ok(true)
        }
        Some(_) => Ok(false),
        None => {
            debug!(%actor, "actor gone before latest activity flush");
            Ok(false)
        }
    }
}

/// Reads the persisted latest activity of an actor.
pub fn stored_latest(conn: &Connection, actor: ActorId) -> Result<Option<LatestActivity>, StoreError> {
    let (id, date): (i64, i64) = conn.query_row(
        "SELECT actor_activity_id, actor_activity_date FROM actors WHERE id = ?1",
        [actor.get()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(ActivityId::from_column(id).map(|activity_id| LatestActivity {
        activity_id,
        activity_date: date,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OriginId;
    use crate::identity::resolve_actor;

    fn actor(db: &Database, oid: &str) -> ActorId {
        resolve_actor(db.connection(), OriginId::new(1), oid)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn keeps_maximum_date_per_actor() {
        let mut index = LatestActivityIndex::new();
        let a = ActorId::new(1);
        index.record_activity(a, ActivityId::new(10), 200);
        index.record_activity(a, ActivityId::new(11), 100);
        index.record_activity(a, ActivityId::new(12), 300);
        index.record_activity(ActorId::new(2), ActivityId::new(13), 50);

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.pending(a),
            Some(LatestActivity {
                activity_id: ActivityId::new(12),
                activity_date: 300
            })
        );
    }

    #[test]
    fn flush_persists_and_clears() {
        let db = Database::in_memory().unwrap();
        let a = actor(&db, "a");
        let mut index = LatestActivityIndex::new();
        index.record_activity(a, ActivityId::new(5), 500);

        let advanced = index.flush(&db, &RetryPolicy::immediate(1)).unwrap();

        assert_eq!(advanced, 1);
        assert!(index.is_empty());
        let stored = stored_latest(db.connection(), a).unwrap().unwrap();
        assert_eq!(stored.activity_id, ActivityId::new(5));
        assert_eq!(stored.activity_date, 500);
    }

    #[test]
    fn flush_never_moves_stored_value_backwards() {
        let db = Database::in_memory().unwrap();
        let a = actor(&db, "a");
        let mut index = LatestActivityIndex::new();
        index.record_activity(a, ActivityId::new(5), 500);

        // A concurrent writer advanced the value after this batch began
        db.connection()
            .execute(
                "UPDATE actors SET actor_activity_id = 9, actor_activity_date = 900 WHERE id = ?1",
                [a.get()],
            )
            .unwrap();

        let advanced = index.flush(&db, &RetryPolicy::immediate(1)).unwrap();
        assert_eq!(advanced, 0);
        let stored = stored_latest(db.connection(), a).unwrap().unwrap();
        assert_eq!(stored.activity_date, 900);
    }

    #[test]
    fn flush_skips_actors_that_no_longer_exist() {
        let db = Database::in_memory().unwrap();
        let mut index = LatestActivityIndex::new();
        index.record_activity(ActorId::new(77), ActivityId::new(1), 10);
        assert_eq!(index.flush(&db, &RetryPolicy::immediate(1)).unwrap(), 0);
    }
}
