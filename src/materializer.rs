//! Activity materializer: turns normalized activities into stored notes, actors and
//! relationship facts.
//!
//! One top-level activity is one unit of work. Everything it implies (nested
//! activities, reblogged notes, in-reply-to parents) is processed from an explicit
//! work queue bounded by [`EngineConfig::max_depth`], inside a single IMMEDIATE
//! transaction that is retried while the store is busy.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Connection, params};
use tracing::{debug, error, info, warn};

use crate::accounts::{AccountContext, account_actors};
use crate::attachments::{AttachmentSink, DownloadTable, attachment_count};
use crate::config::EngineConfig;
use crate::conversation::{ensure_conversation, link_reply};
use crate::identity::{ObjectKind, load_note, lookup, resolve_note, write_actor};
use crate::latest_activity::LatestActivityIndex;
use crate::models::column_value;
use crate::relationships::{apply_follow, followed, note_flag, set_note_flag};
use crate::utils::now_ms;
use crate::{
    Activity, ActivityId, ActivityObject, ActivityType, ActorId, Database, InteractionEvent,
    NoteData, NoteFlag, NoteId, NoteStatus, OriginId, StoreError,
};

/// Result of materializing one top-level activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaterializeOutcome {
    /// The note the activity concerns, directly or through nested activities.
    pub note_id: Option<NoteId>,
    /// Audit row of the top-level activity.
    pub activity_id: Option<ActivityId>,
    /// Whether any note content was written.
    pub content_written: bool,
    /// Whether work was dropped because it exceeded the depth budget.
    pub truncated: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub index_entries_flushed: usize,
}

pub struct ActivityMaterializer<'db> {
    db: &'db Database,
    config: EngineConfig,
    attachments: Box<dyn AttachmentSink>,
    index: LatestActivityIndex,
}

impl<'db> ActivityMaterializer<'db> {
    /// Creates a materializer registering attachments in the `downloads` table.
    pub fn new(db: &'db Database, config: EngineConfig) -> Self {
        Self {
            db,
            config,
            attachments: Box::new(DownloadTable),
            index: LatestActivityIndex::new(),
        }
    }

    pub fn with_attachments(mut self, sink: Box<dyn AttachmentSink>) -> Self {
        self.attachments = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Latest-activity contributions accumulated since the last flush.
    pub fn index(&self) -> &LatestActivityIndex {
        &self.index
    }

    /// Materializes one activity and returns the id of the note it concerns.
    ///
    /// Never fails: an activity that cannot be stored is logged with its id, the
    /// account and the best known note id, and that note id is returned.
    pub fn materialize(&mut self, account: &AccountContext, activity: &Activity) -> Option<NoteId> {
        match self.try_materialize(account, activity) {
            Ok(outcome) => outcome.note_id,
            Err(e) => self.report_failure(account, activity, &e),
        }
    }

    /// Materializes one activity, propagating the error that made it fail.
    ///
    /// On failure nothing of the activity is kept.
    pub fn try_materialize(
        &mut self,
        account: &AccountContext,
        activity: &Activity,
    ) -> Result<MaterializeOutcome, StoreError> {
        let config = &self.config;
        let sink = self.attachments.as_ref();

        let (outcome, contributions) = self.db.write(&config.retry, "materialize", |conn| {
            let mut run = Run::new(conn, account, config, sink)?;
            let outcome = run.process(activity)?;
            Ok((outcome, run.contributions))
        })?;

        // Only committed work contributes to the index
        for (actor, activity_id, date) in contributions {
            self.index.record_activity(actor, activity_id, date);
        }
        Ok(outcome)
    }

    /// Materializes activities in order until done or `cancel` is set.
    ///
    /// Cancellation is observed between activities only. The latest-activity index is
    /// flushed for everything processed, also after cancellation.
    pub fn materialize_batch(
        &mut self,
        account: &AccountContext,
        activities: &[Activity],
        cancel: &AtomicBool,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for activity in activities {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                info!(
                    account = %account.actor_id,
                    processed = report.processed,
                    remaining = activities.len() - report.processed - report.failed,
                    "batch cancelled"
                );
                break;
            }
            match self.try_materialize(account, activity) {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    self.report_failure(account, activity, &e);
                    report.failed += 1;
                }
            }
        }

        match self.flush_index() {
            Ok(flushed) => report.index_entries_flushed = flushed,
            Err(e) => warn!(account = %account.actor_id, "latest activity index not flushed: {e}"),
        }

        debug!(
            account = %account.actor_id,
            processed = report.processed,
            failed = report.failed,
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }

    /// Persists accumulated latest-activity entries.
    pub fn flush_index(&mut self) -> Result<usize, StoreError> {
        self.index.flush(self.db, &self.config.retry)
    }

    fn report_failure(
        &self,
        account: &AccountContext,
        activity: &Activity,
        e: &StoreError,
    ) -> Option<NoteId> {
        let note_id = self.best_known_note(activity);
        error!(
            activity_oid = %activity.audit_key(),
            activity_type = %activity.activity_type,
            account = %account.actor_id,
            note_id = note_id.map(|id| id.get()).unwrap_or(0),
            "failed to materialize activity: {e}"
        );
        note_id
    }

    fn best_known_note(&self, activity: &Activity) -> Option<NoteId> {
        let note = activity.target_note(self.config.max_depth)?;
        lookup(
            self.db.connection(),
            activity.origin_id,
            note.oid.trim(),
            ObjectKind::Note,
        )
        .ok()
        .flatten()
        .map(NoteId::new)
    }
}

/// A queued piece of one activity's work.
enum Work<'a> {
    Activity {
        activity: &'a Activity,
        depth: usize,
    },
    Note {
        note: &'a NoteData,
        origin: OriginId,
        /// Author when the note names none, e.g. the actor of a create.
        default_author: Option<ActorId>,
        /// Timestamp to compare when the note carries none.
        fallback_updated: i64,
        depth: usize,
    },
}

impl Work<'_> {
    fn depth(&self) -> usize {
        match self {
            Self::Activity { depth, .. } | Self::Note { depth, .. } => *depth,
        }
    }
}

/// What the audit row of an activity records.
#[derive(Default)]
struct AuditRecord {
    actor: Option<ActorId>,
    note: Option<NoteId>,
    obj_actor: Option<ActorId>,
    event: InteractionEvent,
}

/// State of one top-level activity being materialized inside its transaction.
struct Run<'a> {
    conn: &'a Connection,
    account: &'a AccountContext,
    config: &'a EngineConfig,
    attachments: &'a dyn AttachmentSink,
    local_actors: HashSet<ActorId>,
    contributions: Vec<(ActorId, ActivityId, i64)>,
    content_written: bool,
    truncated: bool,
}

impl<'a> Run<'a> {
    fn new(
        conn: &'a Connection,
        account: &'a AccountContext,
        config: &'a EngineConfig,
        attachments: &'a dyn AttachmentSink,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            conn,
            account,
            config,
            attachments,
            local_actors: account_actors(conn, account.actor_id)?,
            contributions: Vec::new(),
            content_written: false,
            truncated: false,
        })
    }

    fn is_local(&self, actor: Option<ActorId>) -> bool {
        actor.is_some_and(|a| self.local_actors.contains(&a))
    }

    fn process(&mut self, top: &Activity) -> Result<MaterializeOutcome, StoreError> {
        let mut queue = VecDeque::new();
        let (note_id, activity_id) = self.activity(top, 0, &mut queue)?;

        while let Some(work) = queue.pop_front() {
            if work.depth() > self.config.max_depth {
                warn!(
                    activity_oid = %top.audit_key(),
                    account = %self.account.actor_id,
                    max_depth = self.config.max_depth,
                    "nesting exceeds depth budget, dropping remaining work"
                );
                self.truncated = true;
                continue;
            }
            match work {
                Work::Activity { activity, depth } => {
                    self.activity(activity, depth, &mut queue)?;
                }
                Work::Note {
                    note,
                    origin,
                    default_author,
                    fallback_updated,
                    depth,
                } => {
                    self.note(note, origin, default_author, fallback_updated, depth, &mut queue)?;
                }
            }
        }

        Ok(MaterializeOutcome {
            note_id,
            activity_id: Some(activity_id),
            content_written: self.content_written,
            truncated: self.truncated,
        })
    }

    fn activity<'w>(
        &mut self,
        activity: &'w Activity,
        depth: usize,
        queue: &mut VecDeque<Work<'w>>,
    ) -> Result<(Option<NoteId>, ActivityId), StoreError> {
        let origin = activity.origin_id;
        let actor = write_actor(self.conn, origin, &activity.actor)?;
        let mut record = AuditRecord {
            actor,
            ..AuditRecord::default()
        };

        match activity.activity_type {
            ActivityType::Create | ActivityType::Update => match &activity.object {
                ActivityObject::Note(note) => {
                    record.note =
                        self.note(note, origin, actor, activity.updated_date, depth, queue)?;
                    if let Some(note) = record.note {
                        record.obj_actor = note_author(self.conn, note)?;
                        record.event = self.note_event(note, record.obj_actor)?;
                    }
                }
                ActivityObject::Actor(data) => {
                    record.obj_actor = write_actor(self.conn, origin, data)?;
                }
                ActivityObject::Activity(inner) => {
                    record.note = self.target_of(inner, depth)?;
                    queue.push_back(Work::Activity {
                        activity: inner,
                        depth: depth + 1,
                    });
                }
                ActivityObject::Empty => {
                    return Err(StoreError::malformed(activity.audit_key(), "no object"));
                }
            },
            kind if kind.is_reaction() => {
                let actor = actor.ok_or_else(|| {
                    StoreError::malformed(activity.audit_key(), "reaction without actor")
                })?;
                match kind {
                    ActivityType::Follow | ActivityType::UndoFollow => {
                        self.follow(activity, actor, &mut record)?;
                    }
                    _ => self.react(activity, actor, depth, queue, &mut record)?,
                }
            }
            _ => {
                return Err(StoreError::UnsupportedActivity(activity.audit_key()));
            }
        }

        let activity_id = self.upsert_audit(activity, &record)?;
        if activity.updated_date > 0 {
            let contributors = [Some(self.account.actor_id), record.actor, record.obj_actor];
            for contributor in contributors.into_iter().flatten() {
                self.contributions
                    .push((contributor, activity_id, activity.updated_date));
            }
        }
        Ok((record.note, activity_id))
    }

    /// Resolves the note a reaction is about and queues the reblogged content.
    fn reaction_target<'w>(
        &mut self,
        activity: &'w Activity,
        depth: usize,
        queue: &mut VecDeque<Work<'w>>,
    ) -> Result<Option<NoteId>, StoreError> {
        let stores_content = activity.activity_type == ActivityType::Announce;
        match &activity.object {
            ActivityObject::Note(note) => {
                let id = resolve_note(self.conn, activity.origin_id, &note.oid)?;
                if stores_content && id.is_some() {
                    // The reblogger is not the author of the reblogged note
                    queue.push_back(Work::Note {
                        note,
                        origin: activity.origin_id,
                        default_author: None,
                        fallback_updated: 0,
                        depth: depth + 1,
                    });
                }
                Ok(id)
            }
            ActivityObject::Activity(inner) => {
                let id = self.target_of(inner, depth)?;
                if stores_content {
                    queue.push_back(Work::Activity {
                        activity: inner,
                        depth: depth + 1,
                    });
                }
                Ok(id)
            }
            ActivityObject::Actor(_) | ActivityObject::Empty => Ok(None),
        }
    }

    /// Note id of the note a nested activity ultimately concerns, within the remaining
    /// depth budget.
    fn target_of(&mut self, inner: &Activity, depth: usize) -> Result<Option<NoteId>, StoreError> {
        let remaining = self.config.max_depth.saturating_sub(depth + 1);
        match inner.target_note(remaining) {
            Some(note) => resolve_note(self.conn, inner.origin_id, &note.oid),
            None => Ok(None),
        }
    }

    /// Applies a like, reblog, or their undo to the reacted-to note.
    fn react<'w>(
        &mut self,
        activity: &'w Activity,
        actor: ActorId,
        depth: usize,
        queue: &mut VecDeque<Work<'w>>,
        record: &mut AuditRecord,
    ) -> Result<(), StoreError> {
        let (flag, value) = match activity.activity_type {
            ActivityType::Like => (NoteFlag::Favorited, true),
            ActivityType::UndoLike => (NoteFlag::Favorited, false),
            ActivityType::Announce => (NoteFlag::Reblogged, true),
            _ => (NoteFlag::Reblogged, false),
        };

        match self.reaction_target(activity, depth, queue)? {
            Some(note) => {
                set_note_flag(self.conn, actor, note, flag, value)?;
                record.note = Some(note);
                record.obj_actor = note_author(self.conn, note)?;
                if value && self.is_local(record.obj_actor) && !self.is_local(Some(actor)) {
                    record.event = match flag {
                        NoteFlag::Favorited => InteractionEvent::Like,
                        _ => InteractionEvent::Reblog,
                    };
                }
            }
            None if matches!(activity.object, ActivityObject::Activity(_)) => {
                warn!(
                    activity_oid = %activity.audit_key(),
                    depth,
                    "no reacted-to note within depth budget"
                );
                self.truncated = true;
            }
            None => {
                return Err(StoreError::malformed(
                    activity.audit_key(),
                    "reaction without target note",
                ));
            }
        }
        Ok(())
    }

    fn follow(
        &mut self,
        activity: &Activity,
        actor: ActorId,
        record: &mut AuditRecord,
    ) -> Result<(), StoreError> {
        let origin = activity.origin_id;
        let ActivityObject::Actor(data) = &activity.object else {
            return Err(StoreError::malformed(
                activity.audit_key(),
                "follow target is not an actor",
            ));
        };
        let target = write_actor(self.conn, origin, data)?.ok_or_else(|| {
            StoreError::malformed(activity.audit_key(), "follow target has no oid")
        })?;

        let follows = activity.activity_type == ActivityType::Follow;
        apply_follow(self.conn, actor, target, follows)?;

        record.obj_actor = Some(target);
        if follows && self.is_local(Some(target)) && !self.is_local(Some(actor)) {
            record.event = InteractionEvent::Follow;
        }
        Ok(())
    }

    fn note<'w>(
        &mut self,
        note: &'w NoteData,
        origin: OriginId,
        default_author: Option<ActorId>,
        fallback_updated: i64,
        depth: usize,
        queue: &mut VecDeque<Work<'w>>,
    ) -> Result<Option<NoteId>, StoreError> {
        let Some(id) = resolve_note(self.conn, origin, &note.oid)? else {
            warn!(account = %self.account.actor_id, "note without oid, skipping");
            return Ok(None);
        };
        let author = match &note.author {
            Some(data) if !data.is_empty() => write_actor(self.conn, origin, data)?,
            _ => None,
        }
        .or(default_author);
        let stored = load_note(self.conn, id)?.ok_or(StoreError::NoteNotFound(id))?;

        if note.status == NoteStatus::Unknown || note.has_no_body() {
            if stored.status.is_loaded() {
                return Ok(Some(id));
            }
            if note.status != NoteStatus::Unknown {
                warn!(note_id = %id, oid = %note.oid, "note delivered without body, keeping stub");
            }
            if stored.author_id.is_none()
                && let Some(author) = author
            {
                self.conn.execute(
                    "UPDATE notes SET author_id = ?1 WHERE id = ?2",
                    params![author.get(), id.get()],
                )?;
            }
            self.link(id, note, origin, depth, queue)?;
            return Ok(Some(id));
        }

        let incoming_updated = if note.updated_date > 0 {
            note.updated_date
        } else {
            fallback_updated
        };
        let first_load = !stored.status.is_loaded();
        let newer = incoming_updated > stored.updated_date;
        let accept = newer
            || (first_load
                && (self.config.first_load_overrides || incoming_updated >= stored.updated_date));
        if !accept {
            debug!(
                note_id = %id,
                stored = stored.updated_date,
                incoming = incoming_updated,
                "note content not newer than stored, skipping"
            );
            // Flags are per account, so a copy seen by another account still sets them
            self.write_audience(id, note, origin)?;
            self.mark_subscribed(id, author.or(stored.author_id))?;
            return Ok(Some(id));
        }

        self.conn.execute(
            "UPDATE notes SET
                note_status = ?2,
                created_date = CASE WHEN ?3 > 0 THEN ?3 ELSE created_date END,
                updated_date = ?4,
                author_id = CASE WHEN ?5 > 0 THEN ?5 ELSE author_id END,
                content = ?6,
                name = ?7,
                summary = ?8,
                url = ?9,
                conversation_oid = CASE WHEN ?10 != '' THEN ?10 ELSE conversation_oid END
             WHERE id = ?1",
            params![
                id.get(),
                note.status.code(),
                note.created_date,
                incoming_updated,
                column_value(author),
                note.content,
                note.name,
                note.summary,
                note.url,
                note.conversation_oid.trim(),
            ],
        )?;
        self.content_written = true;
        debug!(note_id = %id, first_load, "wrote note content");

        self.write_audience(id, note, origin)?;
        self.mark_subscribed(id, author)?;
        self.link(id, note, origin, depth, queue)?;

        if first_load || attachment_count(self.conn, id)? == 0 {
            let kept = self
                .attachments
                .register_attachments(self.conn, id, &note.attachments)?;
            self.attachments
                .delete_attachments_not_in(self.conn, id, &kept)?;
        }
        Ok(Some(id))
    }

    fn write_audience(
        &mut self,
        note_id: NoteId,
        note: &NoteData,
        origin: OriginId,
    ) -> Result<(), StoreError> {
        let mut mentioned = false;
        for member in &note.audience {
            let Some(actor) = write_actor(self.conn, origin, member)? else {
                continue;
            };
            self.conn.execute(
                "INSERT INTO audience (note_id, actor_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                params![note_id.get(), actor.get()],
            )?;
            mentioned |= self.local_actors.contains(&actor);
        }
        if mentioned {
            set_note_flag(
                self.conn,
                self.account.actor_id,
                note_id,
                NoteFlag::Mentioned,
                true,
            )?;
        }
        Ok(())
    }

    fn mark_subscribed(&mut self, note: NoteId, author: Option<ActorId>) -> Result<(), StoreError> {
        let subscribed = self.account.home_timeline
            || match author {
                Some(author) => followed(self.conn, self.account.actor_id, author)?.is_true(),
                None => false,
            };
        if subscribed {
            set_note_flag(
                self.conn,
                self.account.actor_id,
                note,
                NoteFlag::Subscribed,
                true,
            )?;
        }
        Ok(())
    }

    /// Links a note to its parent and queues the parent, or roots its conversation.
    fn link<'w>(
        &mut self,
        id: NoteId,
        note: &'w NoteData,
        origin: OriginId,
        depth: usize,
        queue: &mut VecDeque<Work<'w>>,
    ) -> Result<(), StoreError> {
        let parent = match note.in_reply_to.as_deref() {
            Some(parent) => resolve_note(self.conn, origin, &parent.oid)?.map(|id| (parent, id)),
            None => None,
        };
        match parent {
            Some((parent, parent_id)) => {
                link_reply(self.conn, id, parent_id, self.config.cascade_limit)?;
                queue.push_back(Work::Note {
                    note: parent,
                    origin,
                    default_author: None,
                    fallback_updated: 0,
                    depth: depth + 1,
                });
            }
            None => {
                ensure_conversation(self.conn, id)?;
            }
        }
        Ok(())
    }

    /// Interaction a note activity means for the account.
    fn note_event(
        &self,
        note: NoteId,
        author: Option<ActorId>,
    ) -> Result<InteractionEvent, StoreError> {
        if self.is_local(author) {
            return Ok(InteractionEvent::None);
        }
        if note_flag(self.conn, self.account.actor_id, note, NoteFlag::Mentioned)? {
            return Ok(InteractionEvent::Mention);
        }
        let parent = load_note(self.conn, note)?.and_then(|n| n.in_reply_to);
        if let Some(parent) = parent
            && self.is_local(note_author(self.conn, parent)?)
        {
            return Ok(InteractionEvent::Reply);
        }
        Ok(InteractionEvent::None)
    }

    fn upsert_audit(
        &self,
        activity: &Activity,
        record: &AuditRecord,
    ) -> Result<ActivityId, StoreError> {
        let key = activity.audit_key();
        self.conn.execute(
            "INSERT INTO activities (origin_id, activity_oid, activity_type, actor_id, note_id,
                obj_actor_id, account_actor_id, interaction_event, updated_date, ins_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(origin_id, activity_oid) DO UPDATE SET
                activity_type = excluded.activity_type,
                actor_id = CASE WHEN excluded.actor_id != 0 THEN excluded.actor_id ELSE actor_id END,
                note_id = CASE WHEN excluded.note_id != 0 THEN excluded.note_id ELSE note_id END,
                obj_actor_id = CASE WHEN excluded.obj_actor_id != 0
                                    THEN excluded.obj_actor_id ELSE obj_actor_id END,
                interaction_event = CASE WHEN excluded.interaction_event != 0
                                         THEN excluded.interaction_event ELSE interaction_event END,
                updated_date = MAX(updated_date, excluded.updated_date)",
            params![
                activity.origin_id.get(),
                key,
                activity.activity_type.as_str(),
                column_value(record.actor),
                column_value(record.note),
                column_value(record.obj_actor),
                self.account.actor_id.get(),
                record.event.code(),
                activity.updated_date,
                now_ms(),
            ],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM activities WHERE origin_id = ?1 AND activity_oid = ?2",
            params![activity.origin_id.get(), key],
            |row| row.get(0),
        )?;
        Ok(ActivityId::new(id))
    }
}

fn note_author(conn: &Connection, note: NoteId) -> Result<Option<ActorId>, StoreError> {
    Ok(load_note(conn, note)?.and_then(|n| n.author_id))
}
