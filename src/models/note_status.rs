use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a note row.
///
/// Stored as a small integer code in `notes.note_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    /// Identity known, content not yet seen (stub).
    #[default]
    Unknown,
    /// Locally authored and not yet sent.
    Draft,
    /// Locally authored, send in progress.
    Sending,
    /// Content and timestamps present.
    Loaded,
    /// Last load or send failed, may succeed on retry.
    SoftError,
    /// Last load or send failed permanently.
    HardError,
}

impl NoteStatus {
    /// Returns the integer code persisted for this status.
    pub fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Draft => 1,
            Self::Sending => 2,
            Self::Loaded => 3,
            Self::SoftError => 4,
            Self::HardError => 5,
        }
    }

    /// Decodes a persisted code; unrecognized codes read as `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Draft,
            2 => Self::Sending,
            3 => Self::Loaded,
            4 => Self::SoftError,
            5 => Self::HardError,
            _ => Self::Unknown,
        }
    }

    pub fn is_loaded(self) -> bool {
        self == Self::Loaded
    }

    /// True for locally authored notes that have not been confirmed by the server.
    pub fn is_unsent(self) -> bool {
        matches!(self, Self::Draft | Self::Sending)
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Draft => "draft",
            Self::Sending => "sending",
            Self::Loaded => "loaded",
            Self::SoftError => "soft_error",
            Self::HardError => "hard_error",
        };
        f.write_str(name)
    }
}
