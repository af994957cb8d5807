use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ActivityId, ActorId, OriginId, UserId};

pub(crate) const ACTOR_COLUMNS: &str = "id, origin_id, actor_oid, username, webfinger, \
     real_name, profile_url, avatar_url, user_id, group_type, parent_actor_id, \
     notes_count, followers_count, following_count, updated_date, \
     actor_activity_id, actor_activity_date";

/// Kind of group an actor row represents.
///
/// Plain persons are `NotAGroup`. `Friends` and `Followers` are pseudo-actors owned by a
/// parent actor and used only for membership bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    #[default]
    NotAGroup,
    /// Actors the parent follows.
    Friends,
    /// Actors following the parent.
    Followers,
}

impl GroupType {
    pub fn code(self) -> i64 {
        match self {
            Self::NotAGroup => 0,
            Self::Friends => 1,
            Self::Followers => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Friends,
            2 => Self::Followers,
            _ => Self::NotAGroup,
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAGroup => write!(f, "actor"),
            Self::Friends => write!(f, "friends"),
            Self::Followers => write!(f, "followers"),
        }
    }
}

/// An actor as stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub origin_id: OriginId,
    pub oid: Option<String>,
    pub username: String,
    pub webfinger: String,
    pub real_name: String,
    pub profile_url: String,
    pub avatar_url: String,
    pub user_id: Option<UserId>,
    pub group_type: GroupType,
    pub parent_actor_id: Option<ActorId>,
    pub notes_count: i64,
    pub followers_count: i64,
    pub following_count: i64,
    pub updated_date: i64,
    pub latest_activity_id: Option<ActivityId>,
    pub latest_activity_date: i64,
}

impl Actor {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let oid: Option<String> = row.get(2)?;
        Ok(Self {
            id: ActorId::new(row.get(0)?),
            origin_id: OriginId::new(row.get(1)?),
            oid: oid.filter(|s| !s.is_empty()),
            username: row.get(3)?,
            webfinger: row.get(4)?,
            real_name: row.get(5)?,
            profile_url: row.get(6)?,
            avatar_url: row.get(7)?,
            user_id: UserId::from_column(row.get(8)?),
            group_type: GroupType::from_code(row.get(9)?),
            parent_actor_id: ActorId::from_column(row.get(10)?),
            notes_count: row.get(11)?,
            followers_count: row.get(12)?,
            following_count: row.get(13)?,
            updated_date: row.get(14)?,
            latest_activity_id: ActivityId::from_column(row.get(15)?),
            latest_activity_date: row.get(16)?,
        })
    }

    /// Username given to actors created before any of their data has been seen.
    pub fn placeholder_username(oid: &str) -> String {
        format!("id:{oid}")
    }

    pub fn has_placeholder_username(&self) -> bool {
        self.username.starts_with("id:")
    }
}
