//! Users and local accounts.
//!
//! A user is the person behind one or more actor records, possibly on several
//! origins. An account is an actor the user is signed in as.

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::identity::write_actor;
use crate::{ActorData, ActorId, OriginId, StoreError, UserId};

/// Context an activity was received under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountContext {
    /// The account actor whose relationship flags the activity affects.
    pub actor_id: ActorId,
    pub origin_id: OriginId,
    /// Received through a timeline the account subscribes to (home timeline).
    pub home_timeline: bool,
}

impl AccountContext {
    pub fn new(actor_id: ActorId, origin_id: OriginId) -> Self {
        Self {
            actor_id,
            origin_id,
            home_timeline: false,
        }
    }

    pub fn home(mut self) -> Self {
        self.home_timeline = true;
        self
    }
}

/// Links an actor to the user identified by `webfinger`, creating the user when absent.
///
/// An actor already linked to a user keeps its link. `is_my_user` only ever upgrades.
pub fn link_user(
    conn: &Connection,
    actor: ActorId,
    webfinger: &str,
    is_my_user: bool,
) -> Result<UserId, StoreError> {
    conn.execute(
        "INSERT INTO users (webfinger, is_my_user) VALUES (?1, ?2)
         ON CONFLICT(webfinger) DO UPDATE SET is_my_user = MAX(is_my_user, excluded.is_my_user)",
        params![webfinger, is_my_user as i64],
    )?;
    let user: i64 = conn.query_row(
        "SELECT id FROM users WHERE webfinger = ?1",
        [webfinger],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE actors SET user_id = ?1 WHERE id = ?2 AND user_id = 0",
        params![user, actor.get()],
    )?;
    Ok(UserId::new(user))
}

/// Registers an actor as a local account and returns its id.
///
/// Actors without a webfinger id are linked to a user keyed by their oid.
pub fn register_account(
    conn: &Connection,
    origin: OriginId,
    data: &ActorData,
) -> Result<ActorId, StoreError> {
    let actor = write_actor(conn, origin, data)?
        .ok_or_else(|| StoreError::malformed(&data.username, "account actor has no oid"))?;

    conn.execute(
        "INSERT INTO accounts (actor_id, origin_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
        params![actor.get(), origin.get()],
    )?;

    let webfinger = if data.webfinger.trim().is_empty() {
        data.oid.trim()
    } else {
        data.webfinger.trim()
    };
    let user = link_user(conn, actor, webfinger, true)?;
    conn.execute(
        "UPDATE users SET is_my_user = 1 WHERE id = (SELECT user_id FROM actors WHERE id = ?1)",
        [actor.get()],
    )?;

    info!(actor = %actor, user = %user, origin = %origin, "registered account");
    Ok(actor)
}

pub fn is_account(conn: &Connection, actor: ActorId) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM accounts WHERE actor_id = ?1)",
        [actor.get()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// All registered account actors, oldest first.
pub fn list_accounts(conn: &Connection) -> Result<Vec<ActorId>, StoreError> {
    let mut stmt = conn.prepare("SELECT actor_id FROM accounts ORDER BY actor_id")?;
    let ids = stmt
        .query_map([], |row| row.get(0).map(ActorId::new))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Context for activities received by a registered account, `None` when `actor` is not
/// an account.
pub fn account_context(
    conn: &Connection,
    actor: ActorId,
) -> Result<Option<AccountContext>, StoreError> {
    let origin: Option<i64> = conn
        .query_row(
            "SELECT origin_id FROM accounts WHERE actor_id = ?1",
            [actor.get()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(origin.map(|origin| AccountContext::new(actor, OriginId::new(origin))))
}

fn user_of(conn: &Connection, actor: ActorId) -> Result<Option<UserId>, StoreError> {
    let user: Option<i64> = conn
        .query_row(
            "SELECT user_id FROM actors WHERE id = ?1",
            [actor.get()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(user.and_then(UserId::from_column))
}

/// Every actor record that belongs to the same user as `account`, the account included.
pub fn account_actors(conn: &Connection, account: ActorId) -> Result<HashSet<ActorId>, StoreError> {
    let mut actors = HashSet::from([account]);
    if let Some(user) = user_of(conn, account)? {
        let mut stmt = conn.prepare("SELECT id FROM actors WHERE user_id = ?1")?;
        for id in stmt.query_map([user.get()], |row| row.get::<_, i64>(0))? {
            actors.insert(ActorId::new(id?));
        }
    }
    Ok(actors)
}

/// True when both actor records belong to the same underlying user.
pub fn same_user(conn: &Connection, a: ActorId, b: ActorId) -> Result<bool, StoreError> {
    if a == b {
        return Ok(true);
    }
    match (user_of(conn, a)?, user_of(conn, b)?) {
        (Some(ua), Some(ub)) => Ok(ua == ub),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::identity::resolve_actor;

    fn alice(oid: &str) -> ActorData {
        ActorData {
            oid: oid.into(),
            username: "alice".into(),
            webfinger: "alice@example.com".into(),
            ..ActorData::default()
        }
    }

    #[test]
    fn register_account_marks_user_as_mine() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let actor = register_account(conn, OriginId::new(1), &alice("a1")).unwrap();

        assert!(is_account(conn, actor).unwrap());
        assert_eq!(
            account_context(conn, actor).unwrap(),
            Some(AccountContext::new(actor, OriginId::new(1)))
        );
        let mine: i64 = conn
            .query_row(
                "SELECT u.is_my_user FROM users u JOIN actors a ON a.user_id = u.id WHERE a.id = ?1",
                [actor.get()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(mine, 1);
    }

    #[test]
    fn register_account_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let first = register_account(conn, OriginId::new(1), &alice("a1")).unwrap();
        let second = register_account(conn, OriginId::new(1), &alice("a1")).unwrap();
        assert_eq!(first, second);
        assert_eq!(list_accounts(conn).unwrap(), vec![first]);
    }

    #[test]
    fn actors_sharing_webfinger_across_origins_are_the_same_user() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let account = register_account(conn, OriginId::new(1), &alice("a1")).unwrap();
        let other = write_actor(conn, OriginId::new(2), &alice("a2")).unwrap().unwrap();
        let stranger = resolve_actor(conn, OriginId::new(2), "bob").unwrap().unwrap();

        assert!(same_user(conn, account, other).unwrap());
        assert!(!same_user(conn, account, stranger).unwrap());
        assert_eq!(
            account_actors(conn, account).unwrap(),
            HashSet::from([account, other])
        );
    }

    #[test]
    fn actors_without_users_are_only_the_same_when_identical() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();
        let a = resolve_actor(conn, OriginId::new(1), "a").unwrap().unwrap();
        let b = resolve_actor(conn, OriginId::new(1), "b").unwrap().unwrap();
        assert!(same_user(conn, a, a).unwrap());
        assert!(!same_user(conn, a, b).unwrap());
    }
}
