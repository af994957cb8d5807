use serde::{Deserialize, Serialize};
use std::fmt;

/// Per (actor, note) boolean relationship flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteFlag {
    Favorited,
    Reblogged,
    /// The note reached the account through a timeline the account subscribes to.
    Subscribed,
    Mentioned,
}

impl NoteFlag {
    /// Column in `note_relations` holding this flag.
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::Favorited => "favorited",
            Self::Reblogged => "reblogged",
            Self::Subscribed => "subscribed",
            Self::Mentioned => "mentioned",
        }
    }
}

impl fmt::Display for NoteFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A boolean that may also be "no information".
///
/// `Unknown` is stored as NULL and never means "false".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    True,
    False,
    #[default]
    Unknown,
}

impl TriState {
    pub fn from_column(value: Option<i64>) -> Self {
        match value {
            Some(0) => Self::False,
            Some(_) => Self::True,
            None => Self::Unknown,
        }
    }

    pub fn to_column(self) -> Option<i64> {
        match self {
            Self::True => Some(1),
            Self::False => Some(0),
            Self::Unknown => None,
        }
    }

    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// Interaction classification left on each activity audit row for the
/// notification layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionEvent {
    #[default]
    None,
    Mention,
    Reply,
    Reblog,
    Like,
    Follow,
}

impl InteractionEvent {
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Mention => 1,
            Self::Reply => 2,
            Self::Reblog => 3,
            Self::Like => 4,
            Self::Follow => 5,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Mention,
            2 => Self::Reply,
            3 => Self::Reblog,
            4 => Self::Like,
            5 => Self::Follow,
            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state_null_is_unknown_not_false() {
        assert_eq!(TriState::from_column(None), TriState::Unknown);
        assert_eq!(TriState::from_column(Some(0)), TriState::False);
        assert_eq!(TriState::from_column(Some(1)), TriState::True);
        assert_eq!(TriState::Unknown.to_column(), None);
    }

    #[test]
    fn interaction_event_codes_round_trip() {
        for event in [
            InteractionEvent::None,
            InteractionEvent::Mention,
            InteractionEvent::Reply,
            InteractionEvent::Reblog,
            InteractionEvent::Like,
            InteractionEvent::Follow,
        ] {
            assert_eq!(InteractionEvent::from_code(event.code()), event);
        }
    }
}
