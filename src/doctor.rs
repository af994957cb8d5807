//! Health check for a weave store.
//!
//! Provides the `doctor` command functionality:
//! - Database connection and migration status
//! - Row counts and note status breakdown
//! - Consistency findings the repair and merge passes would fix

use anyhow::Result;

use crate::utils::format_ms;
use crate::{Database, NoteStatus};

// ANSI color codes for terminal output
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

/// Health status for a component.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    Ok,
    /// Functional, but a consistency pass should run
    Warning(String),
    Error(String),
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Ok)
    }
}

#[derive(Debug)]
pub struct MigrationInfo {
    pub version: u32,
    pub description: String,
    pub applied_at: i64,
}

/// Row counts and consistency findings.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub accounts: i64,
    pub actors: i64,
    pub notes: i64,
    pub activities: i64,
    pub relationship_rows: i64,
    pub follow_rows: i64,
    pub downloads: i64,
    /// Note count per status, in status code order, empty statuses omitted.
    pub notes_by_status: Vec<(NoteStatus, i64)>,
    /// Notes without a conversation id.
    pub unlinked_notes: i64,
    /// Notes whose in-reply-to points at a note that no longer exists.
    pub orphaned_replies: i64,
    /// (origin, oid) pairs held by more than one actor record.
    pub duplicate_actor_groups: i64,
    pub identity_index: bool,
    pub latest_activity_date: i64,
}

impl StoreStats {
    pub fn consistency(&self) -> HealthStatus {
        let mut findings = Vec::new();
        if self.unlinked_notes > 0 || self.orphaned_replies > 0 {
            findings.push(format!(
                "{} unlinked notes, {} orphaned replies: run `weave repair`",
                self.unlinked_notes, self.orphaned_replies
            ));
        }
        if self.duplicate_actor_groups > 0 || !self.identity_index {
            findings.push(format!(
                "{} duplicate actor identities: run `weave merge-actors`",
                self.duplicate_actor_groups
            ));
        }
        if findings.is_empty() {
            HealthStatus::Ok
        } else {
            HealthStatus::Warning(findings.join("; "))
        }
    }
}

/// Performs all health checks and prints results.
pub fn run_health_checks(db_path: &str, db: &Database) -> Result<()> {
    let connection = match db.connection().query_row("SELECT 1", [], |_| Ok(())) {
        Ok(()) => HealthStatus::Ok,
        Err(e) => HealthStatus::Error(format!("Connection test failed: {e}")),
    };
    let migrations = get_applied_migrations(db)?;
    let stats = get_store_stats(db)?;

    print_health_report(db_path, &connection, &migrations, &stats);
    Ok(())
}

pub fn get_applied_migrations(db: &Database) -> Result<Vec<MigrationInfo>> {
    let conn = db.connection();
    let mut stmt = conn.prepare(
        "SELECT version, applied_at, description FROM schema_migrations ORDER BY version",
    )?;

    let migrations = stmt.query_map([], |row| {
        Ok(MigrationInfo {
            version: row.get(0)?,
            applied_at: row.get(1)?,
            description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        })
    })?;

    migrations.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn get_store_stats(db: &Database) -> Result<StoreStats> {
    let conn = db.connection();
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

    let mut stmt =
        conn.prepare("SELECT note_status, COUNT(*) FROM notes GROUP BY note_status ORDER BY note_status")?;
    let notes_by_status = stmt
        .query_map([], |row| {
            Ok((NoteStatus::from_code(row.get(0)?), row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StoreStats {
        accounts: count("SELECT COUNT(*) FROM accounts")?,
        actors: count("SELECT COUNT(*) FROM actors")?,
        notes: count("SELECT COUNT(*) FROM notes")?,
        activities: count("SELECT COUNT(*) FROM activities")?,
        relationship_rows: count("SELECT COUNT(*) FROM note_relations")?,
        follow_rows: count("SELECT COUNT(*) FROM follows")?,
        downloads: count("SELECT COUNT(*) FROM downloads")?,
        notes_by_status,
        unlinked_notes: count("SELECT COUNT(*) FROM notes WHERE conversation_id = 0")?,
        orphaned_replies: count(
            "SELECT COUNT(*) FROM notes n
             WHERE n.in_reply_to_note_id != 0
               AND NOT EXISTS (SELECT 1 FROM notes p WHERE p.id = n.in_reply_to_note_id)",
        )?,
        duplicate_actor_groups: count(
            "SELECT COUNT(*) FROM (
                 SELECT 1 FROM actors
                 WHERE actor_oid IS NOT NULL AND actor_oid != ''
                 GROUP BY origin_id, actor_oid HAVING COUNT(*) > 1)",
        )?,
        identity_index: db.actor_identity_index_exists()?,
        latest_activity_date: count("SELECT COALESCE(MAX(actor_activity_date), 0) FROM actors")?,
    })
}

fn status_symbol(status: &HealthStatus) -> &'static str {
    match status {
        HealthStatus::Ok => "\u{2713}",
        HealthStatus::Warning(_) => "!",
        HealthStatus::Error(_) => "\u{2717}",
    }
}

fn status_color(status: &HealthStatus) -> &'static str {
    match status {
        HealthStatus::Ok => GREEN,
        HealthStatus::Warning(_) => YELLOW,
        HealthStatus::Error(_) => RED,
    }
}

fn print_health_report(
    db_path: &str,
    connection: &HealthStatus,
    migrations: &[MigrationInfo],
    stats: &StoreStats,
) {
    println!("{BOLD}weave doctor{RESET}");
    println!();

    println!("{BOLD}Database{RESET}");
    println!(
        "  {}{}{RESET} Connection: {}",
        status_color(connection),
        status_symbol(connection),
        if connection.is_ok() { "OK" } else { "FAILED" }
    );
    println!("    {DIM}Path: {db_path}{RESET}");
    println!();

    println!("{BOLD}Migrations{RESET}");
    if migrations.is_empty() {
        println!("  {YELLOW}No migrations applied{RESET}");
    } else {
        for m in migrations {
            println!(
                "  {GREEN}{}{RESET} v{}: {}",
                status_symbol(&HealthStatus::Ok),
                m.version,
                m.description
            );
        }
    }
    println!();

    println!("{BOLD}Statistics{RESET}");
    println!("  Accounts:   {:>6}", stats.accounts);
    println!("  Actors:     {:>6}", stats.actors);
    println!("  Notes:      {:>6} total", stats.notes);
    for (status, count) in &stats.notes_by_status {
        println!("              {count:>6} {status}");
    }
    println!("  Activities: {:>6}", stats.activities);
    println!(
        "  Relations:  {:>6} note  {:>6} follow",
        stats.relationship_rows, stats.follow_rows
    );
    println!("  Downloads:  {:>6}", stats.downloads);
    println!(
        "    {DIM}Latest activity: {}{RESET}",
        format_ms(stats.latest_activity_date)
    );
    println!();

    let consistency = stats.consistency();
    println!("{BOLD}Consistency{RESET}");
    let text = match &consistency {
        HealthStatus::Ok => "OK".to_string(),
        HealthStatus::Warning(w) | HealthStatus::Error(w) => w.clone(),
    };
    println!(
        "  {}{}{RESET} {text}",
        status_color(&consistency),
        status_symbol(&consistency)
    );
}
