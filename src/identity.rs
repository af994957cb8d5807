//! Maps remote object ids to stable local identities.
//!
//! Every function takes a plain `&Connection` so it can run inside the caller's
//! transaction.

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::debug;

use crate::accounts::link_user;
use crate::models::{ACTOR_COLUMNS, NOTE_COLUMNS};
use crate::utils::now_ms;
use crate::{Actor, ActorData, ActorId, GroupType, Note, NoteId, OriginId, StoreError};

/// Insert attempts before giving up on a (origin, oid) pair.
const RESOLVE_ATTEMPTS: usize = 3;

/// Kind of object an identity is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Note,
    Actor,
}

/// Returns the local id for (origin, oid), creating a stub row when absent.
///
/// Returns `None` only for an empty oid: such objects are not yet identifiable.
/// Concurrent resolvers rely on the unique index: a lost insert race is followed by
/// a re-read of the winner's row.
pub fn resolve(
    conn: &Connection,
    origin: OriginId,
    oid: &str,
    kind: ObjectKind,
) -> Result<Option<i64>, StoreError> {
    let oid = oid.trim();
    if oid.is_empty() {
        return Ok(None);
    }

    for attempt in 1..=RESOLVE_ATTEMPTS {
        if let Some(id) = lookup(conn, origin, oid, kind)? {
            return Ok(Some(id));
        }
        match insert_stub(conn, origin, oid, kind) {
            Ok(Some(id)) => {
                debug!(?kind, oid, id, "created stub");
                return Ok(Some(id));
            }
            Ok(None) => debug!(?kind, oid, attempt, "lost insert race, re-reading"),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                debug!(?kind, oid, attempt, "constraint conflict, re-reading")
            }
            Err(e) => return Err(e.into()),
        }
    }

    lookup(conn, origin, oid, kind)?
        .map(Some)
        .ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

pub fn resolve_note(
    conn: &Connection,
    origin: OriginId,
    oid: &str,
) -> Result<Option<NoteId>, StoreError> {
    Ok(resolve(conn, origin, oid, ObjectKind::Note)?.map(NoteId::new))
}

pub fn resolve_actor(
    conn: &Connection,
    origin: OriginId,
    oid: &str,
) -> Result<Option<ActorId>, StoreError> {
    Ok(resolve(conn, origin, oid, ObjectKind::Actor)?.map(ActorId::new))
}

/// Looks up an existing identity without creating one.
///
/// When legacy duplicates of an actor exist, the one registered as an account wins,
/// then the oldest.
pub fn lookup(
    conn: &Connection,
    origin: OriginId,
    oid: &str,
    kind: ObjectKind,
) -> Result<Option<i64>, StoreError> {
    let sql = match kind {
        ObjectKind::Note => {
            "SELECT id FROM notes WHERE origin_id = ?1 AND note_oid = ?2 ORDER BY id LIMIT 1"
        }
        ObjectKind::Actor => {
            "SELECT id FROM actors WHERE origin_id = ?1 AND actor_oid = ?2
             ORDER BY (id IN (SELECT actor_id FROM accounts)) DESC, id ASC LIMIT 1"
        }
    };
    let id = conn
        .query_row(sql, params![origin.get(), oid], |row| row.get(0))
        .optional()?;
    Ok(id)
}

fn insert_stub(
    conn: &Connection,
    origin: OriginId,
    oid: &str,
    kind: ObjectKind,
) -> rusqlite::Result<Option<i64>> {
    let now = now_ms();
    let inserted = match kind {
        ObjectKind::Note => conn.execute(
            "INSERT INTO notes (origin_id, note_oid, note_status, ins_date)
             VALUES (?1, ?2, 0, ?3) ON CONFLICT DO NOTHING",
            params![origin.get(), oid, now],
        )?,
        ObjectKind::Actor => conn.execute(
            "INSERT INTO actors (origin_id, actor_oid, username, ins_date)
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
            params![origin.get(), oid, Actor::placeholder_username(oid), now],
        )?,
    };
    Ok((inserted == 1).then(|| conn.last_insert_rowid()))
}

/// Resolves an actor and writes the data delivered with it.
///
/// Display fields are written when the incoming data is not older than what is stored
/// or the row still carries a placeholder username. Empty fields never erase stored ones.
/// A webfinger id links the actor to its user.
pub fn write_actor(
    conn: &Connection,
    origin: OriginId,
    data: &ActorData,
) -> Result<Option<ActorId>, StoreError> {
    let Some(id) = resolve_actor(conn, origin, &data.oid)? else {
        return Ok(None);
    };

    let (stored_updated, username): (i64, String) = conn.query_row(
        "SELECT updated_date, username FROM actors WHERE id = ?1",
        [id.get()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if data.updated_date >= stored_updated || username.starts_with("id:") {
        conn.execute(
            "UPDATE actors SET
                username = COALESCE(NULLIF(?2, ''), username),
                webfinger = COALESCE(NULLIF(?3, ''), webfinger),
                real_name = COALESCE(NULLIF(?4, ''), real_name),
                profile_url = COALESCE(NULLIF(?5, ''), profile_url),
                avatar_url = COALESCE(NULLIF(?6, ''), avatar_url),
                notes_count = CASE WHEN ?7 > 0 THEN ?7 ELSE notes_count END,
                followers_count = CASE WHEN ?8 > 0 THEN ?8 ELSE followers_count END,
                following_count = CASE WHEN ?9 > 0 THEN ?9 ELSE following_count END,
                updated_date = MAX(updated_date, ?10)
             WHERE id = ?1",
            params![
                id.get(),
                data.username.trim(),
                data.webfinger.trim(),
                data.real_name.trim(),
                data.profile_url.trim(),
                data.avatar_url.trim(),
                data.notes_count,
                data.followers_count,
                data.following_count,
                data.updated_date,
            ],
        )?;
    }

    if !data.webfinger.trim().is_empty() {
        link_user(conn, id, data.webfinger.trim(), false)?;
    }

    Ok(Some(id))
}

/// Returns the friends or followers pseudo-actor of `parent`, creating it when absent.
pub fn group_actor(
    conn: &Connection,
    parent: ActorId,
    group: GroupType,
) -> Result<ActorId, StoreError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM actors WHERE parent_actor_id = ?1 AND group_type = ?2",
            params![parent.get(), group.code()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(ActorId::new(id));
    }

    let (origin, username): (i64, String) = conn
        .query_row(
            "SELECT origin_id, username FROM actors WHERE id = ?1",
            [parent.get()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or(StoreError::ActorNotFound(parent))?;

    conn.execute(
        "INSERT INTO actors (origin_id, username, group_type, parent_actor_id, ins_date)
         VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT DO NOTHING",
        params![
            origin,
            format!("{group}:{username}"),
            group.code(),
            parent.get(),
            now_ms()
        ],
    )?;

    let id = conn.query_row(
        "SELECT id FROM actors WHERE parent_actor_id = ?1 AND group_type = ?2",
        params![parent.get(), group.code()],
        |row| row.get(0),
    )?;
    Ok(ActorId::new(id))
}

pub fn load_note(conn: &Connection, id: NoteId) -> Result<Option<Note>, StoreError> {
    let note = conn
        .query_row(
            &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"),
            [id.get()],
            Note::from_row,
        )
        .optional()?;
    Ok(note)
}

pub fn load_actor(conn: &Connection, id: ActorId) -> Result<Option<Actor>, StoreError> {
    let actor = conn
        .query_row(
            &format!("SELECT {ACTOR_COLUMNS} FROM actors WHERE id = ?1"),
            [id.get()],
            Actor::from_row,
        )
        .optional()?;
    Ok(actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, NoteStatus};

    const ORIGIN: OriginId = OriginId::new(2);

    #[test]
    fn empty_oid_is_not_identifiable() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        assert_eq!(resolve(conn, ORIGIN, "", ObjectKind::Note).unwrap(), None);
        assert_eq!(resolve(conn, ORIGIN, "   ", ObjectKind::Actor).unwrap(), None);
    }

    #[test]
    fn resolving_twice_returns_same_id() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();

        let first = resolve_note(conn, ORIGIN, "https://x/n/1").unwrap().unwrap();
        let second = resolve_note(conn, ORIGIN, "https://x/n/1").unwrap().unwrap();
        assert_eq!(first, second);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn same_oid_on_different_origins_is_distinct() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let a = resolve_note(conn, OriginId::new(1), "n").unwrap();
        let b = resolve_note(conn, OriginId::new(2), "n").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn note_stub_has_unknown_status_and_no_body() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let id = resolve_note(conn, ORIGIN, "n1").unwrap().unwrap();

        let note = load_note(conn, id).unwrap().unwrap();
        assert_eq!(note.status, NoteStatus::Unknown);
        assert!(note.content.is_empty());
        assert_eq!(note.oid.as_deref(), Some("n1"));
        assert!(note.ins_date > 0);
    }

    #[test]
    fn actor_stub_gets_placeholder_username() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let id = resolve_actor(conn, ORIGIN, "acct:a@example.com").unwrap().unwrap();

        let actor = load_actor(conn, id).unwrap().unwrap();
        assert_eq!(actor.username, "id:acct:a@example.com");
        assert!(actor.has_placeholder_username());
    }

    #[test]
    fn write_actor_fills_placeholder_and_keeps_fields_on_partial_update() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        resolve_actor(conn, ORIGIN, "a").unwrap();

        let full = ActorData {
            oid: "a".into(),
            username: "alice".into(),
            real_name: "Alice".into(),
            updated_date: 100,
            followers_count: 3,
            ..ActorData::default()
        };
        let id = write_actor(conn, ORIGIN, &full).unwrap().unwrap();

        let partial = ActorData {
            oid: "a".into(),
            username: "alice2".into(),
            updated_date: 200,
            ..ActorData::default()
        };
        write_actor(conn, ORIGIN, &partial).unwrap();

        let actor = load_actor(conn, id).unwrap().unwrap();
        assert_eq!(actor.username, "alice2");
        assert_eq!(actor.real_name, "Alice");
        assert_eq!(actor.followers_count, 3);
        assert_eq!(actor.updated_date, 200);
    }

    #[test]
    fn older_actor_data_does_not_overwrite() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let newer = ActorData {
            oid: "a".into(),
            username: "new".into(),
            updated_date: 200,
            ..ActorData::default()
        };
        let id = write_actor(conn, ORIGIN, &newer).unwrap().unwrap();

        let older = ActorData {
            oid: "a".into(),
            username: "old".into(),
            updated_date: 100,
            ..ActorData::default()
        };
        write_actor(conn, ORIGIN, &older).unwrap();

        assert_eq!(load_actor(conn, id).unwrap().unwrap().username, "new");
    }

    #[test]
    fn lookup_prefers_account_among_legacy_duplicates() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        conn.execute("DROP INDEX idx_actors_origin_oid", []).unwrap();
        for _ in 0..2 {
            conn.execute(
                "INSERT INTO actors (origin_id, actor_oid, username) VALUES (2, 'dup', 'dup')",
                [],
            )
            .unwrap();
        }
        conn.execute("INSERT INTO accounts (actor_id, origin_id) VALUES (2, 2)", [])
            .unwrap();

        let found = lookup(conn, ORIGIN, "dup", ObjectKind::Actor).unwrap();
        assert_eq!(found, Some(2));
    }

    #[test]
    fn group_actor_is_created_once_per_parent_and_type() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let parent = resolve_actor(conn, ORIGIN, "a").unwrap().unwrap();

        let friends = group_actor(conn, parent, GroupType::Friends).unwrap();
        let again = group_actor(conn, parent, GroupType::Friends).unwrap();
        let followers = group_actor(conn, parent, GroupType::Followers).unwrap();

        assert_eq!(friends, again);
        assert_ne!(friends, followers);
        let group = load_actor(conn, friends).unwrap().unwrap();
        assert_eq!(group.group_type, GroupType::Friends);
        assert_eq!(group.parent_actor_id, Some(parent));
        assert_eq!(group.oid, None);
    }

    #[test]
    fn group_actor_of_missing_parent_fails() {
        let db = Database::in_memory().unwrap();
        let result = group_actor(db.connection(), ActorId::new(99), GroupType::Friends);
        assert!(matches!(result, Err(StoreError::ActorNotFound(_))));
    }
}
