use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::{ActorId, NoteId, NoteStatus, OriginId};

/// Column list matching [`Note::from_row`].
pub(crate) const NOTE_COLUMNS: &str = "id, origin_id, note_oid, author_id, note_status, \
     created_date, updated_date, ins_date, content, name, summary, url, \
     conversation_id, conversation_oid, in_reply_to_note_id";

/// A note as stored locally.
///
/// `conversation_id` and `in_reply_to` are `None` where the column holds 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub origin_id: OriginId,
    /// Remote object id; absent for drafts that were never synced.
    pub oid: Option<String>,
    pub author_id: Option<ActorId>,
    pub status: NoteStatus,
    /// Remote creation time, ms since epoch.
    pub created_date: i64,
    /// Remote update time, ms since epoch. Drives the newer-wins rule.
    pub updated_date: i64,
    /// When this row was first stored locally.
    pub ins_date: i64,
    pub content: String,
    pub name: String,
    pub summary: String,
    pub url: String,
    pub conversation_id: Option<NoteId>,
    pub conversation_oid: String,
    pub in_reply_to: Option<NoteId>,
}

impl Note {
    /// Maps a row selected with [`NOTE_COLUMNS`].
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let oid: Option<String> = row.get(2)?;
        Ok(Self {
            id: NoteId::new(row.get(0)?),
            origin_id: OriginId::new(row.get(1)?),
            oid: oid.filter(|s| !s.is_empty()),
            author_id: ActorId::from_column(row.get::<_, Option<i64>>(3)?.unwrap_or(0)),
            status: NoteStatus::from_code(row.get(4)?),
            created_date: row.get(5)?,
            updated_date: row.get(6)?,
            ins_date: row.get(7)?,
            content: row.get(8)?,
            name: row.get(9)?,
            summary: row.get(10)?,
            url: row.get(11)?,
            conversation_id: NoteId::from_column(row.get(12)?),
            conversation_oid: row.get(13)?,
            in_reply_to: NoteId::from_column(row.get(14)?),
        })
    }

    /// True when this note is the root of its conversation.
    pub fn is_conversation_root(&self) -> bool {
        self.conversation_id == Some(self.id)
    }
}
