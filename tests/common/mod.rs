//! Shared fixture for integration tests.
//!
//! Demo accounts live in the fixture that created them; nothing is cached across tests.
#![allow(dead_code)]

use anyhow::Result;
use weave::identity::{ObjectKind, load_note, lookup};
use weave::{
    AccountContext, Activity, ActivityMaterializer, ActivityObject, ActivityType, ActorData,
    Database, EngineConfig, Note, NoteData, NoteId, OriginId, RetryPolicy, register_account,
};

pub const DEMO_ORIGIN: &str = "demo.example";

/// Engine defaults with retries that do not sleep.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(3),
        ..EngineConfig::default()
    }
}

pub fn demo_actor(name: &str) -> ActorData {
    ActorData {
        oid: format!("https://{DEMO_ORIGIN}/users/{name}"),
        username: name.to_string(),
        webfinger: format!("{name}@{DEMO_ORIGIN}"),
        ..ActorData::default()
    }
}

pub fn note_oid(name: &str) -> String {
    format!("https://{DEMO_ORIGIN}/notes/{name}")
}

/// A loaded note authored by `author`.
pub fn note(name: &str, author: &str, content: &str, updated_date: i64) -> NoteData {
    NoteData {
        oid: note_oid(name),
        author: Some(demo_actor(author)),
        content: content.to_string(),
        created_date: updated_date,
        updated_date,
        ..NoteData::default()
    }
}

/// `note` as a reply to the note called `parent`.
pub fn reply(mut note: NoteData, parent: &str) -> NoteData {
    note.in_reply_to = Some(Box::new(NoteData::reference(note_oid(parent))));
    note
}

pub struct Fixture {
    pub db: Database,
    pub origin: OriginId,
    /// The demo account "me".
    pub account: AccountContext,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Self::with_database(Database::in_memory()?, config)
    }

    pub fn with_database(db: Database, config: EngineConfig) -> Result<Self> {
        let origin = db.ensure_origin(DEMO_ORIGIN)?;
        let actor = register_account(db.connection(), origin, &demo_actor("me"))?;
        Ok(Self {
            db,
            origin,
            account: AccountContext::new(actor, origin),
            config,
        })
    }

    pub fn materializer(&self) -> ActivityMaterializer<'_> {
        ActivityMaterializer::new(&self.db, self.config.clone())
    }

    pub fn activity(&self, kind: ActivityType, actor: &str, object: ActivityObject) -> Activity {
        Activity::new(self.origin, kind, demo_actor(actor), object)
    }

    /// A create activity by the note's author.
    pub fn create(&self, note: NoteData) -> Activity {
        let author = note
            .author
            .clone()
            .unwrap_or_else(|| demo_actor("anonymous"));
        Activity::new(
            self.origin,
            ActivityType::Create,
            author,
            ActivityObject::Note(note),
        )
    }

    pub fn note_id(&self, name: &str) -> Result<Option<NoteId>> {
        let id = lookup(
            self.db.connection(),
            self.origin,
            &note_oid(name),
            ObjectKind::Note,
        )?;
        Ok(id.map(NoteId::new))
    }

    pub fn load(&self, id: NoteId) -> Result<Note> {
        load_note(self.db.connection(), id)?.ok_or_else(|| anyhow::anyhow!("note {id} missing"))
    }

    pub fn count(&self, sql: &str) -> Result<i64> {
        Ok(self.db.connection().query_row(sql, [], |row| row.get(0))?)
    }
}
