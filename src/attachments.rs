//! Hand-off of note attachments to the download manager.

use rusqlite::{Connection, params};
use tracing::debug;

use crate::utils::now_ms;
use crate::{AttachmentRef, DownloadId, NoteId, StoreError};

/// Receives the attachments of materialized notes.
///
/// Calls receive the connection of the running transaction so registrations commit or
/// roll back together with the note they belong to. File system and download queue
/// concerns stay with the implementation.
pub trait AttachmentSink {
    /// Registers attachments for `note`, returning one download id per attachment in
    /// input order. Registering an already known uri returns its existing id.
    fn register_attachments(
        &self,
        conn: &Connection,
        note: NoteId,
        attachments: &[AttachmentRef],
    ) -> Result<Vec<DownloadId>, StoreError>;

    /// Removes registrations of `note` not listed in `kept`. Returns how many were removed.
    fn delete_attachments_not_in(
        &self,
        conn: &Connection,
        note: NoteId,
        kept: &[DownloadId],
    ) -> Result<usize, StoreError>;
}

/// [`AttachmentSink`] backed by the `downloads` table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadTable;

impl AttachmentSink for DownloadTable {
    fn register_attachments(
        &self,
        conn: &Connection,
        note: NoteId,
        attachments: &[AttachmentRef],
    ) -> Result<Vec<DownloadId>, StoreError> {
        let mut insert = conn.prepare_cached(
            "INSERT INTO downloads (note_id, uri, content_type, ins_date) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(note_id, uri) WHERE note_id != 0
             DO UPDATE SET content_type = excluded.content_type",
        )?;
        let mut select =
            conn.prepare_cached("SELECT id FROM downloads WHERE note_id = ?1 AND uri = ?2")?;

        let now = now_ms();
        let mut ids = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            insert.execute(params![
                note.get(),
                attachment.uri,
                attachment.content_type,
                now
            ])?;
            let id: i64 = select.query_row(params![note.get(), attachment.uri], |row| row.get(0))?;
            ids.push(DownloadId::new(id));
        }
        debug!(%note, count = ids.len(), "registered attachments");
        Ok(ids)
    }

    fn delete_attachments_not_in(
        &self,
        conn: &Connection,
        note: NoteId,
        kept: &[DownloadId],
    ) -> Result<usize, StoreError> {
        let placeholders = vec!["?"; kept.len()].join(", ");
        let sql = if kept.is_empty() {
            "DELETE FROM downloads WHERE note_id = ?1".to_string()
        } else {
            format!("DELETE FROM downloads WHERE note_id = ?1 AND id NOT IN ({placeholders})")
        };

        let mut values: Vec<i64> = Vec::with_capacity(kept.len() + 1);
        values.push(note.get());
        values.extend(kept.iter().map(|id| id.get()));
        let deleted = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(deleted)
    }
}

/// Number of attachments registered for a note.
pub fn attachment_count(conn: &Connection, note: NoteId) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM downloads WHERE note_id = ?1",
        [note.get()],
        |row| row.get(0),
    )?;
    Ok(count)
}
