use serde::{Deserialize, Serialize};
use std::fmt;

use super::{NoteStatus, OriginId};

/// Verb of an ingested activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Create,
    Update,
    Like,
    UndoLike,
    /// Reblog / boost / repost.
    Announce,
    UndoAnnounce,
    Follow,
    UndoFollow,
    /// Anything a protocol adapter could not map.
    #[serde(other)]
    Unknown,
}

impl ActivityType {
    pub fn is_reaction(self) -> bool {
        matches!(
            self,
            Self::Like
                | Self::UndoLike
                | Self::Announce
                | Self::UndoAnnounce
                | Self::Follow
                | Self::UndoFollow
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Like => "like",
            Self::UndoLike => "undo_like",
            Self::Announce => "announce",
            Self::UndoAnnounce => "undo_announce",
            Self::Follow => "follow",
            Self::UndoFollow => "undo_follow",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actor fields as delivered by a protocol adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorData {
    pub oid: String,
    pub username: String,
    pub webfinger: String,
    pub real_name: String,
    pub profile_url: String,
    pub avatar_url: String,
    pub updated_date: i64,
    pub notes_count: i64,
    pub followers_count: i64,
    pub following_count: i64,
}

impl ActorData {
    /// Actor known only by its remote id.
    pub fn from_oid(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.oid.is_empty()
    }
}

/// An attachment reference delivered with a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub uri: String,
    #[serde(default)]
    pub content_type: String,
}

impl AttachmentRef {
    pub fn new(uri: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_type: content_type.into(),
        }
    }
}

/// Note fields as delivered by a protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteData {
    pub oid: String,
    /// Status the adapter observed; remote loads arrive as `Loaded`.
    pub status: NoteStatus,
    pub author: Option<ActorData>,
    pub created_date: i64,
    pub updated_date: i64,
    pub content: String,
    pub name: String,
    pub summary: String,
    pub url: String,
    pub conversation_oid: String,
    /// Parent note, possibly carrying only its oid.
    pub in_reply_to: Option<Box<NoteData>>,
    pub audience: Vec<ActorData>,
    pub attachments: Vec<AttachmentRef>,
}

impl Default for NoteData {
    fn default() -> Self {
        Self {
            oid: String::new(),
            status: NoteStatus::Loaded,
            author: None,
            created_date: 0,
            updated_date: 0,
            content: String::new(),
            name: String::new(),
            summary: String::new(),
            url: String::new(),
            conversation_oid: String::new(),
            in_reply_to: None,
            audience: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

impl NoteData {
    /// Reference to a note known only by its remote id.
    pub fn reference(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            status: NoteStatus::Unknown,
            ..Self::default()
        }
    }

    /// True when the adapter delivered nothing that could be shown.
    pub fn has_no_body(&self) -> bool {
        self.content.trim().is_empty() && self.name.trim().is_empty() && self.attachments.is_empty()
    }
}

/// Target of an activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActivityObject {
    Note(NoteData),
    Actor(ActorData),
    /// Nested activity, e.g. a reblog of a reblog or a quoted activity.
    Activity(Box<Activity>),
    #[default]
    Empty,
}

/// A normalized activity handed over by a protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub origin_id: OriginId,
    /// Remote activity id. May be empty for adapters that synthesize activities.
    #[serde(default)]
    pub oid: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub actor: ActorData,
    #[serde(default)]
    pub object: ActivityObject,
    #[serde(default)]
    pub updated_date: i64,
}

impl Activity {
    pub fn new(
        origin_id: OriginId,
        activity_type: ActivityType,
        actor: ActorData,
        object: ActivityObject,
    ) -> Self {
        Self {
            origin_id,
            oid: String::new(),
            activity_type,
            actor,
            object,
            updated_date: 0,
        }
    }

    pub fn with_oid(mut self, oid: impl Into<String>) -> Self {
        self.oid = oid.into();
        self
    }

    pub fn with_updated_date(mut self, updated_date: i64) -> Self {
        self.updated_date = updated_date;
        self
    }

    /// Remote id of the object this activity is about, one level deep.
    pub fn object_oid(&self) -> &str {
        match &self.object {
            ActivityObject::Note(note) => &note.oid,
            ActivityObject::Actor(actor) => &actor.oid,
            ActivityObject::Activity(inner) => &inner.oid,
            ActivityObject::Empty => "",
        }
    }

    /// The note this activity ultimately concerns, following at most `max_hops`
    /// nested activities.
    pub fn target_note(&self, max_hops: usize) -> Option<&NoteData> {
        let mut current = self;
        for _ in 0..=max_hops {
            match &current.object {
                ActivityObject::Note(note) => return Some(note),
                ActivityObject::Activity(inner) => current = inner,
                _ => return None,
            }
        }
        None
    }

    /// Stable key for the audit row: the remote id, or one derived from verb and objects.
    pub fn audit_key(&self) -> String {
        if !self.oid.is_empty() {
            return self.oid.clone();
        }
        format!(
            "{}:{}:{}",
            self.activity_type,
            self.actor.oid,
            self.object_oid()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(oid: &str) -> NoteData {
        NoteData {
            oid: oid.to_string(),
            content: "hello".to_string(),
            ..NoteData::default()
        }
    }

    #[test]
    fn deserializes_adapter_json() {
        let json = r#"{
            "origin_id": 2,
            "oid": "https://example.com/act/1",
            "type": "create",
            "actor": {"oid": "https://example.com/users/a", "username": "a"},
            "object": {"kind": "note", "value": {"oid": "https://example.com/n/1", "content": "hi"}},
            "updated_date": 1000
        }"#;
        let activity: Activity = serde_json::from_str(json).unwrap();

        assert_eq!(activity.activity_type, ActivityType::Create);
        assert_eq!(activity.origin_id, OriginId::new(2));
        let target = activity.target_note(0).expect("note object");
        assert_eq!(target.content, "hi");
        assert_eq!(target.status, NoteStatus::Loaded);
    }

    #[test]
    fn unrecognized_type_maps_to_unknown() {
        let json = r#"{"origin_id": 1, "type": "flag", "actor": {"oid": "a"}}"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert_eq!(activity.activity_type, ActivityType::Unknown);
        assert_eq!(activity.object, ActivityObject::Empty);
    }

    #[test]
    fn target_note_follows_nested_activities_within_budget() {
        let origin = OriginId::new(1);
        let inner = Activity::new(
            origin,
            ActivityType::Create,
            ActorData::from_oid("a"),
            ActivityObject::Note(note("n1")),
        );
        let outer = Activity::new(
            origin,
            ActivityType::Announce,
            ActorData::from_oid("b"),
            ActivityObject::Activity(Box::new(inner)),
        );

        assert_eq!(outer.target_note(1).map(|n| n.oid.as_str()), Some("n1"));
        assert!(outer.target_note(0).is_none());
    }

    #[test]
    fn audit_key_falls_back_to_verb_and_objects() {
        let activity = Activity::new(
            OriginId::new(1),
            ActivityType::Like,
            ActorData::from_oid("a"),
            ActivityObject::Note(note("n1")),
        );
        assert_eq!(activity.audit_key(), "like:a:n1");
        assert_eq!(activity.with_oid("x").audit_key(), "x");
    }

    #[test]
    fn content_activities_are_not_reactions() {
        assert!(ActivityType::UndoAnnounce.is_reaction());
        assert!(ActivityType::Follow.is_reaction());
        for kind in [ActivityType::Create, ActivityType::Update, ActivityType::Unknown] {
            assert!(!kind.is_reaction(), "{kind}");
        }
    }

    #[test]
    fn reference_note_has_no_body() {
        assert!(NoteData::reference("n").has_no_body());
        assert!(!note("n").has_no_body());
    }
}
