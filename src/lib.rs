pub mod accounts;
pub mod attachments;
pub mod config;
pub mod conversation;
pub mod db;
pub mod doctor;
pub mod error;
pub mod identity;
pub mod latest_activity;
pub mod materializer;
pub mod merger;
pub mod models;
pub mod relationships;
pub mod retry;
pub mod utils;

pub use accounts::{AccountContext, register_account};
pub use attachments::{AttachmentSink, DownloadTable};
pub use config::{EngineConfig, RetryPolicy};
pub use conversation::{RepairReport, repair_all};
pub use db::Database;
pub use error::StoreError;
pub use latest_activity::{LatestActivity, LatestActivityIndex};
pub use materializer::{ActivityMaterializer, BatchReport, MaterializeOutcome};
pub use merger::{ActorMerger, MergeOutcome, MergePair, MergeReport};
pub use models::{
    Activity, ActivityId, ActivityObject, ActivityType, Actor, ActorData, ActorId, AttachmentRef,
    DownloadId, GroupType, InteractionEvent, Note, NoteData, NoteFlag, NoteId, NoteStatus,
    OriginId, TriState, UserId,
};
pub use relationships::RelationshipTracker;
pub use retry::retry_on_busy;
