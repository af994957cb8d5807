mod activity;
mod actor;
mod ids;
mod note;
mod note_status;
mod relationship;

pub use activity::{Activity, ActivityObject, ActivityType, ActorData, AttachmentRef, NoteData};
pub use actor::{Actor, GroupType};
pub use ids::{ActivityId, ActorId, DownloadId, NoteId, OriginId, UserId, column_value};
pub use note::Note;
pub use note_status::NoteStatus;
pub use relationship::{InteractionEvent, NoteFlag, TriState};

pub(crate) use actor::ACTOR_COLUMNS;
pub(crate) use note::NOTE_COLUMNS;
