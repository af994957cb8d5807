/// Partial unique index on actor identities.
///
/// Kept out of the migrations: databases written by older schema versions can hold
/// duplicate (origin, oid) actor rows, and the index can only be created once the
/// actor merge pass has folded them.
pub const ACTOR_IDENTITY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_actors_origin_oid
    ON actors(origin_id, actor_oid) WHERE actor_oid IS NOT NULL AND actor_oid != '';
"#;

/// Tables that must exist once every migration has been applied.
pub const EXPECTED_TABLES: &[&str] = &[
    "accounts",
    "activities",
    "actors",
    "audience",
    "downloads",
    "follows",
    "group_members",
    "note_relations",
    "notes",
    "origins",
    "users",
];
