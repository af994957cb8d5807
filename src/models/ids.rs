use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! local_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Creates a new ID from its database value.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the underlying ID value.
            pub fn get(self) -> i64 {
                self.0
            }

            /// Maps a stored column value to an ID, treating 0 and negatives as "not set".
            pub fn from_column(value: i64) -> Option<Self> {
                (value > 0).then_some(Self(value))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

local_id!(
    /// Local identifier of a note row.
    NoteId
);

local_id!(
    /// Local identifier of an actor row (persons, groups and group pseudo-actors).
    ActorId
);

local_id!(
    /// Identifier of the origin (server / protocol instance) a remote object lives on.
    OriginId
);

local_id!(
    /// Local identifier of an activity audit row.
    ActivityId
);

local_id!(
    /// Local identifier of a user: the person behind one or more actor records.
    UserId
);

local_id!(
    /// Local identifier of a registered attachment download.
    DownloadId
);

/// Converts an optional ID into the integer stored in "0 when unset" columns.
pub fn column_value<T: Into<i64>>(id: Option<T>) -> i64 {
    id.map(Into::into).unwrap_or(0)
}

macro_rules! into_i64 {
    ($($name:ident),*) => {
        $(impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        })*
    };
}

into_i64!(NoteId, ActorId, OriginId, ActivityId, UserId, DownloadId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_id_serializes_as_raw_integer() {
        let id = NoteId::new(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");

        let deserialized: NoteId = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, id);
    }

    #[test]
    fn zero_column_value_is_not_an_id() {
        assert_eq!(NoteId::from_column(0), None);
        assert_eq!(ActorId::from_column(-3), None);
        assert_eq!(ActorId::from_column(7), Some(ActorId::new(7)));
    }

    #[test]
    fn unset_ids_store_as_zero() {
        assert_eq!(column_value::<NoteId>(None), 0);
        assert_eq!(column_value(Some(NoteId::new(9))), 9);
    }
}
