//! Relationship facts: per (actor, note) flags, per (actor, actor) follow state and
//! group membership.
//!
//! All writes are idempotent upserts that keep the tables sparse: a row is inserted
//! only when the value being set is true, and updated in place otherwise.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::accounts::same_user;
use crate::config::RetryPolicy;
use crate::identity::group_actor;
use crate::utils::now_ms;
use crate::{ActorId, Database, GroupType, NoteFlag, NoteId, StoreError, TriState};

/// Sets one flag for (actor, note). Returns `true` when stored state changed.
pub fn set_note_flag(
    conn: &Connection,
    actor: ActorId,
    note: NoteId,
    flag: NoteFlag,
    value: bool,
) -> Result<bool, StoreError> {
    let column = flag.column();
    let changed = if value {
        conn.execute(
            &format!(
                "INSERT INTO note_relations (actor_id, note_id, {column}) VALUES (?1, ?2, 1)
                 ON CONFLICT(actor_id, note_id) DO UPDATE SET {column} = 1 WHERE {column} != 1"
            ),
            params![actor.get(), note.get()],
        )?
    } else {
        conn.execute(
            &format!(
                "UPDATE note_relations SET {column} = 0
                 WHERE actor_id = ?1 AND note_id = ?2 AND {column} != 0"
            ),
            params![actor.get(), note.get()],
        )?
    };
    Ok(changed > 0)
}

pub fn note_flag(
    conn: &Connection,
    actor: ActorId,
    note: NoteId,
    flag: NoteFlag,
) -> Result<bool, StoreError> {
    let value: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT {} FROM note_relations WHERE actor_id = ?1 AND note_id = ?2",
                flag.column()
            ),
            params![actor.get(), note.get()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0) != 0)
}

/// Records whether `follower` follows `target`.
///
/// When both records belong to the same user the value is forced to `False` and
/// written even if no row existed, so a stale self-follow can never survive.
/// Returns `true` when stored state changed.
pub fn set_followed(
    conn: &Connection,
    follower: ActorId,
    target: ActorId,
    value: TriState,
) -> Result<bool, StoreError> {
    let self_follow = same_user(conn, follower, target)?;
    let value = if self_follow {
        if value.is_true() {
            debug!(%follower, %target, "self-follow suppressed");
        }
        TriState::False
    } else {
        value
    };

    let now = now_ms();
    let changed = if value.is_true() || self_follow {
        conn.execute(
            "INSERT INTO follows (follower_id, target_id, followed, updated_date) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(follower_id, target_id) DO UPDATE SET followed = excluded.followed,
               updated_date = excluded.updated_date
             WHERE followed IS NOT excluded.followed",
            params![follower.get(), target.get(), value.to_column(), now],
        )?
    } else {
        conn.execute(
            "UPDATE follows SET followed = ?3, updated_date = ?4
             WHERE follower_id = ?1 AND target_id = ?2 AND followed IS NOT ?3",
            params![follower.get(), target.get(), value.to_column(), now],
        )?
    };
    Ok(changed > 0)
}

pub fn followed(
    conn: &Connection,
    follower: ActorId,
    target: ActorId,
) -> Result<TriState, StoreError> {
    let value: Option<Option<i64>> = conn
        .query_row(
            "SELECT followed FROM follows WHERE follower_id = ?1 AND target_id = ?2",
            params![follower.get(), target.get()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(TriState::from_column(value.flatten()))
}

/// Adds or removes `member` from `group`. Membership is row presence.
///
/// A group's parent never becomes a member of its own group, also across the parent's
/// other actor records. Returns `true` when stored state changed.
pub fn set_group_membership(
    conn: &Connection,
    group: ActorId,
    member: ActorId,
    is_member: bool,
) -> Result<bool, StoreError> {
    let parent: Option<i64> = conn
        .query_row(
            "SELECT parent_actor_id FROM actors WHERE id = ?1",
            [group.get()],
            |row| row.get(0),
        )
        .optional()?;
    let parent = parent
        .and_then(ActorId::from_column)
        .unwrap_or(group);

    let is_member = if is_member && same_user(conn, parent, member)? {
        debug!(%group, %member, "self-membership suppressed");
        false
    } else {
        is_member
    };

    let changed = if is_member {
        conn.execute(
            "INSERT INTO group_members (group_id, member_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![group.get(), member.get()],
        )?
    } else {
        conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND member_id = ?2",
            params![group.get(), member.get()],
        )?
    };
    Ok(changed > 0)
}

pub fn is_member(conn: &Connection, group: ActorId, member: ActorId) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM group_members WHERE group_id = ?1 AND member_id = ?2)",
        params![group.get(), member.get()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Applies a follow or unfollow: the follow fact plus the follower's friends group and
/// the target's followers group.
pub fn apply_follow(
    conn: &Connection,
    follower: ActorId,
    target: ActorId,
    value: bool,
) -> Result<bool, StoreError> {
    let mut changed = set_followed(conn, follower, target, TriState::from(value))?;
    let friends = group_actor(conn, follower, GroupType::Friends)?;
    changed |= set_group_membership(conn, friends, target, value)?;
    let followers = group_actor(conn, target, GroupType::Followers)?;
    changed |= set_group_membership(conn, followers, follower, value)?;
    Ok(changed)
}

/// Stand-alone relationship writes for foreground actions.
///
/// Each call runs in its own transaction and is retried while the store is busy.
/// Exhausted retries are logged and reported as "no change": readers keep seeing the
/// previous state until the next successful write.
pub struct RelationshipTracker<'db> {
    db: &'db Database,
    retry: RetryPolicy,
}

impl<'db> RelationshipTracker<'db> {
    pub fn new(db: &'db Database, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn set_note_flag(
        &self,
        actor: ActorId,
        note: NoteId,
        flag: NoteFlag,
        value: bool,
    ) -> Result<bool, StoreError> {
        self.non_fatal("set_note_flag", |conn| {
            set_note_flag(conn, actor, note, flag, value)
        })
    }

    pub fn set_followed(
        &self,
        follower: ActorId,
        target: ActorId,
        value: TriState,
    ) -> Result<bool, StoreError> {
        self.non_fatal("set_followed", |conn| {
            set_followed(conn, follower, target, value)
        })
    }

    pub fn set_group_membership(
        &self,
        group: ActorId,
        member: ActorId,
        is_member: bool,
    ) -> Result<bool, StoreError> {
        self.non_fatal("set_group_membership", |conn| {
            set_group_membership(conn, group, member, is_member)
        })
    }

    fn non_fatal<F>(&self, what: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnMut(&Connection) -> Result<bool, StoreError>,
    {
        match self.db.write(&self.retry, what, f) {
            Err(StoreError::Busy { attempts }) => {
                warn!(what, attempts, "relationship write abandoned, store busy");
                Ok(false)
            }
            other => other,
        }
    }
}
