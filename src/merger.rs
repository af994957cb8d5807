//! Merges duplicate actor records left behind by schema versions without a unique
//! (origin, oid) constraint.
//!
//! Duplicates are resolved by an idle-time pass rather than on the ingestion path:
//! every reference to the dropped id is repointed to the kept id, then the dropped row
//! is deleted, all inside one transaction per pair.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::{ActorId, Database, GroupType, StoreError};

/// One duplicate to resolve: every reference to `drop` moves to `keep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePair {
    pub keep: ActorId,
    pub drop: ActorId,
}

/// A column holding actor ids.
struct ActorReference {
    table: &'static str,
    column: &'static str,
    /// Part of a primary key: rows that would collide with an existing row of the kept
    /// actor are deleted instead of repointed.
    keyed: bool,
}

const fn reference(table: &'static str, column: &'static str, keyed: bool) -> ActorReference {
    ActorReference {
        table,
        column,
        keyed,
    }
}

const ACTOR_REFERENCES: &[ActorReference] = &[
    reference("notes", "author_id", false),
    reference("activities", "actor_id", false),
    reference("activities", "obj_actor_id", false),
    reference("activities", "account_actor_id", false),
    reference("audience", "actor_id", true),
    reference("note_relations", "actor_id", true),
    reference("follows", "follower_id", true),
    reference("follows", "target_id", true),
    reference("group_members", "group_id", true),
    reference("group_members", "member_id", true),
    reference("downloads", "actor_id", false),
    reference("accounts", "actor_id", true),
];

/// Outcome of a single [`ActorMerger::merge`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows now pointing at the kept actor.
    pub repointed: usize,
    /// Reference columns skipped because this schema version lacks them.
    pub skipped_references: usize,
    /// Whether the dropped row was deleted. False when it was already gone.
    pub deleted: bool,
}

/// Outcome of an [`ActorMerger::merge_all`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub candidates: usize,
    pub merged: usize,
    pub failed: usize,
    pub repointed: usize,
    pub skipped_references: usize,
    /// Whether the unique actor identity index exists after the pass.
    pub identity_index: bool,
}

pub struct ActorMerger<'db> {
    db: &'db Database,
    config: &'db EngineConfig,
}

impl<'db> ActorMerger<'db> {
    pub fn new(db: &'db Database, config: &'db EngineConfig) -> Self {
        Self { db, config }
    }

    /// Groups actors by (origin, oid) and returns one pair per superfluous record.
    ///
    /// The kept record is the one registered as a local account when
    /// `merge_prefers_account` is set and exactly one candidate is, otherwise the oldest.
    pub fn find_merge_candidates(&self) -> Result<Vec<MergePair>, StoreError> {
        find_merge_candidates(self.db.connection(), self.config.merge_prefers_account)
    }

    /// Repoints every reference to `pair.drop` and deletes it, in one transaction.
    ///
    /// A reference column missing from this schema version is logged and skipped. Any
    /// other failure rolls the whole merge back so the dropped row is never deleted
    /// while something might still point at it.
    pub fn merge(&self, pair: MergePair) -> Result<MergeOutcome, StoreError> {
        if pair.keep == pair.drop {
            return Ok(MergeOutcome::default());
        }
        self.db
            .write(&self.config.retry, "merge_actors", |conn| merge_in(conn, pair))
    }

    /// Merges every candidate pair, then tries to create the unique identity index.
    ///
    /// A failed pair is logged and the pass moves on; the next pass retries it.
    pub fn merge_all(&self) -> Result<MergeReport, StoreError> {
        let pairs = self.find_merge_candidates()?;
        let mut report = MergeReport {
            candidates: pairs.len(),
            ..MergeReport::default()
        };

        for pair in pairs {
            match self.merge(pair) {
                Ok(outcome) => {
                    report.merged += 1;
                    report.repointed += outcome.repointed;
                    report.skipped_references += outcome.skipped_references;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(keep = %pair.keep, drop = %pair.drop, "actor merge failed: {e}");
                }
            }
        }

        report.identity_index = self.db.ensure_actor_identity_index()?;
        info!(
            candidates = report.candidates,
            merged = report.merged,
            failed = report.failed,
            repointed = report.repointed,
            identity_index = report.identity_index,
            "actor merge pass finished"
        );
        Ok(report)
    }
}

struct Candidate {
    origin_id: i64,
    oid: String,
    id: ActorId,
    is_account: bool,
}

pub fn find_merge_candidates(
    conn: &Connection,
    prefer_account: bool,
) -> Result<Vec<MergePair>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT a.origin_id, a.actor_oid, a.id, a.id IN (SELECT actor_id FROM accounts)
         FROM actors a
         WHERE (a.origin_id, a.actor_oid) IN (
             SELECT origin_id, actor_oid FROM actors
             WHERE actor_oid IS NOT NULL AND actor_oid != ''
             GROUP BY origin_id, actor_oid HAVING COUNT(*) > 1)
         ORDER BY a.origin_id, a.actor_oid, a.id",
    )?;
    let candidates = stmt
        .query_map([], |row| {
            Ok(Candidate {
                origin_id: row.get(0)?,
                oid: row.get(1)?,
                id: ActorId::new(row.get(2)?),
                is_account: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut pairs = Vec::new();
    for group in candidates.chunk_by(|a, b| a.origin_id == b.origin_id && a.oid == b.oid) {
        let keep = choose_keep(group, prefer_account);
        debug!(oid = %group[0].oid, %keep, duplicates = group.len() - 1, "duplicate actor identity");
        pairs.extend(
            group
                .iter()
                .filter(|c| c.id != keep)
                .map(|c| MergePair { keep, drop: c.id }),
        );
    }
    Ok(pairs)
}

/// Candidates arrive ordered by id, so the first one is the oldest.
fn choose_keep(group: &[Candidate], prefer_account: bool) -> ActorId {
    let oldest = group[0].id;
    if !prefer_account {
        return oldest;
    }
    let mut accounts = group.iter().filter(|c| c.is_account);
    match (accounts.next(), accounts.next()) {
        (Some(only), None) => only.id,
        _ => oldest,
    }
}

fn actor_exists(conn: &Connection, id: ActorId) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM actors WHERE id = ?1)",
        [id.get()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn merge_in(conn: &Connection, pair: MergePair) -> Result<MergeOutcome, StoreError> {
    let mut outcome = MergeOutcome::default();
    if !actor_exists(conn, pair.drop)? {
        debug!(drop = %pair.drop, "duplicate already merged");
        return Ok(outcome);
    }
    if !actor_exists(conn, pair.keep)? {
        return Err(StoreError::ActorNotFound(pair.keep));
    }

    merge_groups(conn, pair, &mut outcome)?;
    repoint_all(conn, pair, &mut outcome)?;
    merge_actor_fields(conn, pair)?;
    drop_self_relations(conn, pair.keep)?;

    outcome.deleted = conn.execute("DELETE FROM actors WHERE id = ?1", [pair.drop.get()])? > 0;
    debug!(
        keep = %pair.keep,
        drop = %pair.drop,
        repointed = outcome.repointed,
        skipped = outcome.skipped_references,
        "merged actor"
    );
    Ok(outcome)
}

/// Folds the dropped actor's friends and followers groups into the kept actor's.
fn merge_groups(
    conn: &Connection,
    pair: MergePair,
    outcome: &mut MergeOutcome,
) -> Result<(), StoreError> {
    for group in [GroupType::Friends, GroupType::Followers] {
        let dropped = group_of(conn, pair.drop, group)?;
        let Some(dropped) = dropped else { continue };

        match group_of(conn, pair.keep, group)? {
            Some(kept) => {
                let group_pair = MergePair {
                    keep: kept,
                    drop: dropped,
                };
                repoint_all(conn, group_pair, outcome)?;
                conn.execute("DELETE FROM actors WHERE id = ?1", [dropped.get()])?;
            }
            None => {
                outcome.repointed += conn.execute(
                    "UPDATE actors SET parent_actor_id = ?1 WHERE id = ?2",
                    params![pair.keep.get(), dropped.get()],
                )?;
            }
        }
    }
    Ok(())
}

fn group_of(
    conn: &Connection,
    parent: ActorId,
    group: GroupType,
) -> Result<Option<ActorId>, StoreError> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM actors WHERE parent_actor_id = ?1 AND group_type = ?2",
            params![parent.get(), group.code()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(ActorId::new))
}

fn repoint_all(
    conn: &Connection,
    pair: MergePair,
    outcome: &mut MergeOutcome,
) -> Result<(), StoreError> {
    for reference in ACTOR_REFERENCES {
        match repoint(conn, reference, pair) {
            Ok(moved) => outcome.repointed += moved,
            Err(e) if e.is_missing_schema_object() => {
                warn!(
                    table = reference.table,
                    column = reference.column,
                    "skipping actor reference missing from schema: {e}"
                );
                outcome.skipped_references += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn repoint(
    conn: &Connection,
    reference: &ActorReference,
    pair: MergePair,
) -> Result<usize, StoreError> {
    let ActorReference {
        table,
        column,
        keyed,
    } = reference;
    let moved = conn.execute(
        &format!("UPDATE OR IGNORE {table} SET {column} = ?1 WHERE {column} = ?2"),
        params![pair.keep.get(), pair.drop.get()],
    )?;
    if *keyed {
        // Rows left behind collided with one the kept actor already has
        conn.execute(
            &format!("DELETE FROM {table} WHERE {column} = ?1"),
            [pair.drop.get()],
        )?;
    }
    Ok(moved)
}

struct ActorFields {
    user_id: i64,
    username: String,
    webfinger: String,
    real_name: String,
    updated_date: i64,
    activity_id: i64,
    activity_date: i64,
}

fn actor_fields(conn: &Connection, id: ActorId) -> Result<ActorFields, StoreError> {
    let fields = conn.query_row(
        "SELECT user_id, username, webfinger, real_name, updated_date,
                actor_activity_id, actor_activity_date
         FROM actors WHERE id = ?1",
        [id.get()],
        |row| {
            Ok(ActorFields {
                user_id: row.get(0)?,
                username: row.get(1)?,
                webfinger: row.get(2)?,
                real_name: row.get(3)?,
                updated_date: row.get(4)?,
                activity_id: row.get(5)?,
                activity_date: row.get(6)?,
            })
        },
    )?;
    Ok(fields)
}

/// Fills gaps of the kept actor from the dropped one and keeps the newer latest activity.
fn merge_actor_fields(conn: &Connection, pair: MergePair) -> Result<(), StoreError> {
    let mut kept = actor_fields(conn, pair.keep)?;
    let dropped = actor_fields(conn, pair.drop)?;

    if kept.user_id == 0 {
        kept.user_id = dropped.user_id;
    }
    if kept.username.starts_with("id:") && !dropped.username.starts_with("id:") {
        kept.username = dropped.username;
    }
    if kept.webfinger.is_empty() {
        kept.webfinger = dropped.webfinger;
    }
    if kept.real_name.is_empty() {
        kept.real_name = dropped.real_name;
    }
    kept.updated_date = kept.updated_date.max(dropped.updated_date);
    if dropped.activity_date > kept.activity_date {
        kept.activity_id = dropped.activity_id;
        kept.activity_date = dropped.activity_date;
    }

    conn.execute(
        "UPDATE actors SET user_id = ?2, username = ?3, webfinger = ?4, real_name = ?5,
            updated_date = ?6, actor_activity_id = ?7, actor_activity_date = ?8
         WHERE id = ?1",
        params![
            pair.keep.get(),
            kept.user_id,
            kept.username,
            kept.webfinger,
            kept.real_name,
            kept.updated_date,
            kept.activity_id,
            kept.activity_date
        ],
    )?;
    Ok(())
}

/// Repointing can turn a follow between two records of one actor into a self-follow.
fn drop_self_relations(conn: &Connection, keep: ActorId) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM follows WHERE follower_id = ?1 AND target_id = ?1",
        [keep.get()],
    )?;
    conn.execute(
        "DELETE FROM group_members WHERE member_id = ?1
           AND group_id IN (SELECT id FROM actors WHERE parent_actor_id = ?1)",
        [keep.get()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::relationships::{apply_follow, followed, is_member};
    use crate::{NoteFlag, NoteId, TriState};

    const ORIGIN: i64 = 2;
    const OID: &str = "acct:a@example.com";

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::immediate(1),
            ..EngineConfig::default()
        }
    }

    /// Simulates a store created before the identity index existed.
    fn legacy_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.connection()
            .execute_batch("DROP INDEX idx_actors_origin_oid")
            .unwrap();
        db
    }

    fn insert_actor(db: &Database, id: i64, origin: i64, oid: &str) {
        db.connection()
            .execute(
                "INSERT INTO actors (id, origin_id, actor_oid, username) VALUES (?1, ?2, ?3, ?4)",
                params![id, origin, oid, format!("user{id}")],
            )
            .unwrap();
    }

    fn count(db: &Database, sql: &str) -> i64 {
        db.connection().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn account_record_is_kept_even_when_newer() {
        let db = legacy_db();
        insert_actor(&db, 3, ORIGIN, OID);
        insert_actor(&db, 7, ORIGIN, OID);
        db.connection()
            .execute("INSERT INTO accounts (actor_id, origin_id) VALUES (7, 2)", [])
            .unwrap();

        let pairs = find_merge_candidates(db.connection(), true).unwrap();
        assert_eq!(
            pairs,
            vec![MergePair {
                keep: ActorId::new(7),
                drop: ActorId::new(3)
            }]
        );

        let pairs = find_merge_candidates(db.connection(), false).unwrap();
        assert_eq!(pairs[0].keep, ActorId::new(3));
    }

    #[test]
    fn oldest_record_is_kept_without_accounts() {
        let db = legacy_db();
        insert_actor(&db, 4, ORIGIN, OID);
        insert_actor(&db, 8, ORIGIN, OID);
        insert_actor(&db, 12, ORIGIN, OID);
        insert_actor(&db, 13, ORIGIN + 1, OID);

        let pairs = find_merge_candidates(db.connection(), true).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.keep == ActorId::new(4)));
    }

    #[test]
    fn merge_repoints_every_reference_and_deletes_duplicate() {
        let db = legacy_db();
        let conn = db.connection();
        insert_actor(&db, 5, ORIGIN, OID);
        insert_actor(&db, 9, ORIGIN, OID);
        insert_actor(&db, 20, ORIGIN, "acct:friend@example.com");
        conn.execute("INSERT INTO accounts (actor_id, origin_id) VALUES (5, 2)", [])
            .unwrap();
        conn.execute_batch(
            "INSERT INTO notes (id, origin_id, note_oid, author_id) VALUES (100, 2, 'n1', 9);
             INSERT INTO notes (id, origin_id, note_oid, author_id) VALUES (101, 2, 'n2', 20);
             INSERT INTO activities (origin_id, activity_oid, activity_type, actor_id, note_id)
                 VALUES (2, 'act1', 'create', 9, 100);
             INSERT INTO activities (origin_id, activity_oid, activity_type, actor_id, obj_actor_id)
                 VALUES (2, 'act2', 'follow', 20, 9);
             INSERT INTO audience (note_id, actor_id) VALUES (101, 9);
             INSERT INTO note_relations (actor_id, note_id, favorited) VALUES (9, 101, 1);
             INSERT INTO note_relations (actor_id, note_id, reblogged) VALUES (5, 101, 1);
             INSERT INTO downloads (actor_id, uri) VALUES (9, 'https://x/avatar.png');",
        )
        .unwrap();
        apply_follow(conn, ActorId::new(9), ActorId::new(20), true).unwrap();
        apply_follow(conn, ActorId::new(20), ActorId::new(9), true).unwrap();

        let cfg = config();
        let merger = ActorMerger::new(&db, &cfg);
        let pairs = merger.find_merge_candidates().unwrap();
        assert_eq!(
            pairs,
            vec![MergePair {
                keep: ActorId::new(5),
                drop: ActorId::new(9)
            }]
        );

        let outcome = merger.merge(pairs[0]).unwrap();
        assert!(outcome.deleted);

        assert_eq!(count(&db, "SELECT COUNT(*) FROM actors WHERE id = 9"), 0);
        for sql in [
            "SELECT COUNT(*) FROM notes WHERE author_id = 9",
            "SELECT COUNT(*) FROM activities WHERE actor_id = 9 OR obj_actor_id = 9",
            "SELECT COUNT(*) FROM audience WHERE actor_id = 9",
            "SELECT COUNT(*) FROM note_relations WHERE actor_id = 9",
            "SELECT COUNT(*) FROM follows WHERE follower_id = 9 OR target_id = 9",
            "SELECT COUNT(*) FROM group_members WHERE member_id = 9",
            "SELECT COUNT(*) FROM downloads WHERE actor_id = 9",
            "SELECT COUNT(*) FROM actors WHERE parent_actor_id = 9",
        ] {
            assert_eq!(count(&db, sql), 0, "{sql}");
        }
        assert_eq!(count(&db, "SELECT author_id FROM notes WHERE id = 100"), 5);
        assert_eq!(
            count(&db, "SELECT obj_actor_id FROM activities WHERE activity_oid = 'act2'"),
            5
        );
        assert_eq!(count(&db, "SELECT COUNT(*) FROM downloads WHERE actor_id = 5"), 1);

        // The colliding relation row of 9 was dropped, 5 keeps its own
        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM note_relations WHERE note_id = 101"),
            1
        );
        assert!(crate::relationships::note_flag(
            conn,
            ActorId::new(5),
            NoteId::new(101),
            NoteFlag::Reblogged
        )
        .unwrap());

        assert_eq!(
            followed(conn, ActorId::new(5), ActorId::new(20)).unwrap(),
            TriState::True
        );
        assert_eq!(
            followed(conn, ActorId::new(20), ActorId::new(5)).unwrap(),
            TriState::True
        );
        let friends = group_of(conn, ActorId::new(5), GroupType::Friends)
            .unwrap()
            .unwrap();
        assert!(is_member(conn, friends, ActorId::new(20)).unwrap());

        assert!(merger.find_merge_candidates().unwrap().is_empty());
    }

    #[test]
    fn merge_removes_follows_that_become_self_follows() {
        let db = legacy_db();
        let conn = db.connection();
        insert_actor(&db, 5, ORIGIN, OID);
        insert_actor(&db, 9, ORIGIN, OID);
        conn.execute(
            "INSERT INTO follows (follower_id, target_id, followed) VALUES (9, 5, 1)",
            [],
        )
        .unwrap();

        let cfg = config();
        let merger = ActorMerger::new(&db, &cfg);
        merger
            .merge(MergePair {
                keep: ActorId::new(5),
                drop: ActorId::new(9),
            })
            .unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM follows"), 0);
    }

    #[test]
    fn missing_reference_table_is_skipped() {
        let db = legacy_db();
        insert_actor(&db, 5, ORIGIN, OID);
        insert_actor(&db, 9, ORIGIN, OID);
        db.connection().execute_batch("DROP TABLE downloads").unwrap();

        let cfg = config();
        let outcome = ActorMerger::new(&db, &cfg)
            .merge(MergePair {
                keep: ActorId::new(5),
                drop: ActorId::new(9),
            })
            .unwrap();

        assert_eq!(outcome.skipped_references, 1);
        assert!(outcome.deleted);
    }

    #[test]
    fn merge_all_restores_identity_index_and_is_idempotent() {
        let db = legacy_db();
        insert_actor(&db, 5, ORIGIN, OID);
        insert_actor(&db, 9, ORIGIN, OID);
        assert!(!db.ensure_actor_identity_index().unwrap());

        let cfg = config();
        let merger = ActorMerger::new(&db, &cfg);
        let report = merger.merge_all().unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.merged, 1);
        assert!(report.identity_index);
        assert!(db.actor_identity_index_exists().unwrap());

        let again = merger.merge_all().unwrap();
        assert_eq!(again.candidates, 0);
        assert_eq!(again.merged, 0);
    }

    #[test]
    fn merging_an_already_merged_pair_is_a_no_op() {
        let db = legacy_db();
        insert_actor(&db, 5, ORIGIN, OID);
        let cfg = config();
        let outcome = ActorMerger::new(&db, &cfg)
            .merge(MergePair {
                keep: ActorId::new(5),
                drop: ActorId::new(9),
            })
            .unwrap();
        assert!(!outcome.deleted);
    }
}
