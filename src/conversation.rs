//! Conversation linking and the batch repair sweep.
//!
//! A conversation is the set of notes sharing `conversation_id`; its root is the note
//! whose id equals that value. Inline linking keeps replies consistent as they arrive,
//! while [`repair_all`] heals chains left broken by partial or out-of-order ingestion.

use std::collections::{HashMap, HashSet, VecDeque};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::{Database, NoteId, StoreError};

/// Outcome of a [`repair_all`] sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub scanned: usize,
    /// Notes whose conversation id was corrected.
    pub conversations_fixed: usize,
    /// Notes whose dangling in-reply-to was cleared.
    pub orphans_cleared: usize,
    /// Notes not reachable from any root: reply cycles or chains deeper than the cap.
    pub unreachable: usize,
    /// Corrections that failed to write.
    pub failed: usize,
}

struct LinkRow {
    origin_id: i64,
    conversation_id: i64,
    conversation_oid: String,
}

fn link_row(conn: &Connection, note: NoteId) -> Result<LinkRow, StoreError> {
    conn.query_row(
        "SELECT origin_id, conversation_id, conversation_oid FROM notes WHERE id = ?1",
        [note.get()],
        |row| {
            Ok(LinkRow {
                origin_id: row.get(0)?,
                conversation_id: row.get(1)?,
                conversation_oid: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or(StoreError::NoteNotFound(note))
}

/// Conversation already assigned to notes carrying the given remote conversation id.
fn conversation_by_oid(
    conn: &Connection,
    origin_id: i64,
    conversation_oid: &str,
) -> Result<Option<NoteId>, StoreError> {
    if conversation_oid.is_empty() {
        return Ok(None);
    }
    let id: Option<i64> = conn
        .query_row(
            "SELECT conversation_id FROM notes
             WHERE origin_id = ?1 AND conversation_oid = ?2 AND conversation_id != 0
             ORDER BY id LIMIT 1",
            params![origin_id, conversation_oid],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.and_then(NoteId::from_column))
}

/// Gives a note without a parent its conversation id when it has none yet.
///
/// Notes sharing a remote conversation id join the conversation already assigned to
/// it; otherwise the note roots its own conversation.
pub fn ensure_conversation(conn: &Connection, note: NoteId) -> Result<NoteId, StoreError> {
    let row = link_row(conn, note)?;
    if let Some(existing) = NoteId::from_column(row.conversation_id) {
        return Ok(existing);
    }
    let conversation =
        conversation_by_oid(conn, row.origin_id, &row.conversation_oid)?.unwrap_or(note);
    conn.execute(
        "UPDATE notes SET conversation_id = ?1 WHERE id = ?2",
        params![conversation.get(), note.get()],
    )?;
    Ok(conversation)
}

/// Links `child` as a reply to `parent` and returns the shared conversation id.
///
/// A parent without a conversation becomes a conversation root (or joins the
/// conversation named by the child's remote conversation id). When the child moves to
/// a different conversation, its already-linked replies follow it, up to
/// `cascade_limit` hops down.
pub fn link_reply(
    conn: &Connection,
    child: NoteId,
    parent: NoteId,
    cascade_limit: usize,
) -> Result<NoteId, StoreError> {
    if child == parent {
        warn!(note = %child, "note claims to reply to itself, ignoring link");
        return ensure_conversation(conn, child);
    }
    if is_ancestor(conn, child, parent, cascade_limit)? {
        warn!(%child, %parent, "reply link would close a cycle, ignoring link");
        return ensure_conversation(conn, child);
    }

    let parent_row = link_row(conn, parent)?;
    let child_row = link_row(conn, child)?;

    let conversation = match NoteId::from_column(parent_row.conversation_id) {
        Some(existing) => existing,
        None => {
            let oid = if child_row.conversation_oid.is_empty() {
                &parent_row.conversation_oid
            } else {
                &child_row.conversation_oid
            };
            let conversation =
                conversation_by_oid(conn, parent_row.origin_id, oid)?.unwrap_or(parent);
            conn.execute(
                "UPDATE notes SET conversation_id = ?1,
                   conversation_oid = CASE WHEN conversation_oid = '' THEN ?2 ELSE conversation_oid END
                 WHERE id = ?3",
                params![conversation.get(), oid, parent.get()],
            )?;
            conversation
        }
    };

    conn.execute(
        "UPDATE notes SET in_reply_to_note_id = ?1, conversation_id = ?2 WHERE id = ?3",
        params![parent.get(), conversation.get(), child.get()],
    )?;

    if child_row.conversation_id != conversation.get() {
        let moved = cascade(conn, child, conversation, cascade_limit)?;
        if moved > 0 {
            debug!(%child, %conversation, moved, "moved replies to new conversation");
        }
    }
    Ok(conversation)
}

/// True when `candidate` is `note` itself or one of its ancestors.
fn is_ancestor(
    conn: &Connection,
    candidate: NoteId,
    note: NoteId,
    limit: usize,
) -> Result<bool, StoreError> {
    let mut current = note;
    for _ in 0..=limit {
        if current == candidate {
            return Ok(true);
        }
        let parent: Option<i64> = conn
            .query_row(
                "SELECT in_reply_to_note_id FROM notes WHERE id = ?1",
                [current.get()],
                |row| row.get(0),
            )
            .optional()?;
        match parent.and_then(NoteId::from_column) {
            Some(p) => current = p,
            None => return Ok(false),
        }
    }
    Ok(false)
}

/// Sets `conversation` on every reply below `start`. Returns the number of rows moved.
fn cascade(
    conn: &Connection,
    start: NoteId,
    conversation: NoteId,
    limit: usize,
) -> Result<usize, StoreError> {
    let mut children_stmt =
        conn.prepare_cached("SELECT id FROM notes WHERE in_reply_to_note_id = ?1")?;
    let mut update_stmt = conn.prepare_cached(
        "UPDATE notes SET conversation_id = ?1 WHERE id = ?2 AND conversation_id != ?1",
    )?;

    let mut visited = HashSet::from([start]);
    let mut worklist = vec![(start, 0usize)];
    let mut moved = 0;

    while let Some((note, depth)) = worklist.pop() {
        let children = children_stmt
            .query_map([note.get()], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for child in children.into_iter().map(NoteId::new) {
            if !visited.insert(child) {
                continue;
            }
            if depth + 1 > limit {
                warn!(%start, %child, limit, "conversation cascade hit hop limit, stopping");
                return Ok(moved);
            }
            moved += update_stmt.execute(params![conversation.get(), child.get()])?;
            worklist.push((child, depth + 1));
        }
    }
    Ok(moved)
}

struct SweepRow {
    origin_id: i64,
    in_reply_to: i64,
    conversation_id: i64,
    conversation_oid: String,
}

/// Idle-time sweep over every note.
///
/// Clears in-reply-to links whose parent is gone (the note becomes its own root),
/// gives roots without a valid conversation the conversation already assigned to their
/// remote conversation id, or else their own id, and propagates each root's
/// conversation id down its reply tree. Runs in one transaction; a note whose
/// correction fails is logged and skipped.
pub fn repair_all(db: &Database, config: &EngineConfig) -> Result<RepairReport, StoreError> {
    let report = db.write(&config.retry, "repair_conversations", |conn| {
        repair_in(conn, config.cascade_limit)
    })?;
    info!(
        scanned = report.scanned,
        fixed = report.conversations_fixed,
        orphans = report.orphans_cleared,
        unreachable = report.unreachable,
        failed = report.failed,
        "conversation repair finished"
    );
    Ok(report)
}

fn repair_in(conn: &Connection, limit: usize) -> Result<RepairReport, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, origin_id, in_reply_to_note_id, conversation_id, conversation_oid
         FROM notes ORDER BY id",
    )?;
    let rows: HashMap<i64, SweepRow> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                SweepRow {
                    origin_id: row.get(1)?,
                    in_reply_to: row.get(2)?,
                    conversation_id: row.get(3)?,
                    conversation_oid: row.get(4)?,
                },
            ))
        })?
        .collect::<Result<_, _>>()?;

    let mut report = RepairReport {
        scanned: rows.len(),
        ..RepairReport::default()
    };

    let mut orphans = HashSet::new();
    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut roots = Vec::new();
    for (&id, row) in &rows {
        match row.in_reply_to {
            0 => roots.push(id),
            parent if parent == id || !rows.contains_key(&parent) => {
                orphans.insert(id);
                roots.push(id);
            }
            parent => children.entry(parent).or_default().push(id),
        }
    }
    roots.sort_unstable();

    let is_valid_root = |conv: i64| {
        rows.get(&conv)
            .is_some_and(|other| other.in_reply_to == 0 && other.conversation_id == conv)
            && !orphans.contains(&conv)
    };

    // Remote conversation id -> conversation already assigned to it, lowest note id first
    let mut ids: Vec<i64> = rows.keys().copied().collect();
    ids.sort_unstable();
    let mut by_oid: HashMap<(i64, &str), i64> = HashMap::new();
    for id in ids {
        let row = &rows[&id];
        if row.conversation_oid.is_empty()
            || orphans.contains(&id)
            || !is_valid_root(row.conversation_id)
        {
            continue;
        }
        by_oid
            .entry((row.origin_id, row.conversation_oid.as_str()))
            .or_insert(row.conversation_id);
    }

    let mut target: HashMap<i64, i64> = HashMap::with_capacity(rows.len());
    for &root in &roots {
        let row = &rows[&root];
        let joined = || {
            by_oid
                .get(&(row.origin_id, row.conversation_oid.as_str()))
                .copied()
        };
        let conversation = match row.conversation_id {
            conv if conv == root => root,
            _ if orphans.contains(&root) => root,
            conv if is_valid_root(conv) => conv,
            _ => joined().unwrap_or(root),
        };
        target.insert(root, conversation);

        let mut queue = VecDeque::from([(root, 0usize)]);
        while let Some((note, depth)) = queue.pop_front() {
            let Some(replies) = children.get(&note) else {
                continue;
            };
            if depth + 1 > limit {
                warn!(root, note, limit, "reply chain deeper than hop limit, not descending");
                continue;
            }
            for &reply in replies {
                if target.insert(reply, conversation).is_none() {
                    queue.push_back((reply, depth + 1));
                }
            }
        }
    }

    report.unreachable = rows.len() - target.len();
    if report.unreachable > 0 {
        let sample: Vec<i64> = rows
            .keys()
            .filter(|id| !target.contains_key(id))
            .take(10)
            .copied()
            .collect();
        warn!(count = report.unreachable, ?sample, "notes unreachable from any conversation root");
    }

    let mut clear_stmt =
        conn.prepare("UPDATE notes SET in_reply_to_note_id = 0 WHERE id = ?1")?;
    let mut orphan_ids: Vec<i64> = orphans.into_iter().collect();
    orphan_ids.sort_unstable();
    for id in orphan_ids {
        match clear_stmt.execute([id]) {
            Ok(_) => report.orphans_cleared += 1,
            Err(e) => {
                warn!(note = id, "failed to clear orphaned in-reply-to: {e}");
                report.failed += 1;
            }
        }
    }

    let mut fix_stmt = conn.prepare("UPDATE notes SET conversation_id = ?1 WHERE id = ?2")?;
    let mut fixes: Vec<(i64, i64)> = target
        .into_iter()
        .filter(|(id, conv)| rows[id].conversation_id != *conv)
        .collect();
    fixes.sort_unstable();
    for (id, conversation) in fixes {
        match fix_stmt.execute(params![conversation, id]) {
            Ok(_) => report.conversations_fixed += 1,
            Err(e) => {
                warn!(note = id, conversation, "failed to correct conversation id: {e}");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
