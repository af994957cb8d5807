use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use weave::accounts::{account_context, list_accounts};
use weave::doctor::run_health_checks;
use weave::utils::{ensure_database_directory, get_database_path};
use weave::{
    Activity, ActivityMaterializer, ActorData, ActorId, ActorMerger, Database, EngineConfig,
    register_account, repair_all,
};

/// weave - activity ingestion and conversation materialization store
#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Materializes federated activities into a local conversation store")]
#[command(version)]
struct Cli {
    /// Database file (defaults to WEAVE_DB or the platform data directory)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an actor as a local account
    RegisterAccount(RegisterAccountCommand),
    /// Materialize activities from a JSON lines file
    Ingest(IngestCommand),
    /// Repair conversation links across all notes
    Repair,
    /// Merge duplicate actor records
    MergeActors,
    /// Show store health and statistics
    Doctor,
}

#[derive(Parser)]
struct RegisterAccountCommand {
    /// Origin (server) name, created when unknown
    #[arg(long, value_name = "NAME")]
    origin: String,

    /// Remote id of the account actor
    #[arg(long, value_name = "OID")]
    oid: String,

    #[arg(long, default_value = "")]
    username: String,

    /// Webfinger id, e.g. alice@example.com
    #[arg(long, default_value = "")]
    webfinger: String,
}

#[derive(Parser)]
struct IngestCommand {
    /// File with one JSON activity per line
    #[arg(value_name = "FILE.jsonl")]
    file: PathBuf,

    /// Local actor id of the receiving account
    #[arg(long, value_name = "ID")]
    account: i64,

    /// Activities come from the account's home timeline
    #[arg(long)]
    home: bool,
}

/// Errors caused by invocation rather than by the store.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UserError(String);

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let result = run(&cli);

    if let Err(e) = result {
        // Determine exit code based on error type
        let exit_code = if is_user_error(&e) { 1 } else { 2 };
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code);
    }
}

/// User errors are invalid arguments or input files; everything else is internal.
fn is_user_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<UserError>())
}

fn run(cli: &Cli) -> Result<()> {
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => get_database_path()?,
    };
    ensure_database_directory(&db_path)?;
    let db = Database::open(&db_path).context("Failed to open database")?;
    let config = EngineConfig::from_env();

    match &cli.command {
        Commands::RegisterAccount(cmd) => execute_register_account(cmd, &db),
        Commands::Ingest(cmd) => execute_ingest(cmd, &db, config),
        Commands::Repair => execute_repair(&db, &config),
        Commands::MergeActors => execute_merge(&db, &config),
        Commands::Doctor => run_health_checks(&db_path.display().to_string(), &db),
    }
}

fn execute_register_account(cmd: &RegisterAccountCommand, db: &Database) -> Result<()> {
    if cmd.origin.trim().is_empty() || cmd.oid.trim().is_empty() {
        return Err(UserError("origin and oid cannot be empty".into()).into());
    }
    let origin = db.ensure_origin(cmd.origin.trim())?;
    let data = ActorData {
        oid: cmd.oid.trim().to_string(),
        username: cmd.username.clone(),
        webfinger: cmd.webfinger.clone(),
        ..ActorData::default()
    };
    let actor = register_account(db.connection(), origin, &data)?;
    println!("Account registered (actor id: {actor}, origin id: {origin})");
    Ok(())
}

fn execute_ingest(cmd: &IngestCommand, db: &Database, config: EngineConfig) -> Result<()> {
    let actor = ActorId::new(cmd.account);
    let Some(mut account) = account_context(db.connection(), actor)? else {
        let known = list_accounts(db.connection())?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(UserError(format!(
            "actor {actor} is not a registered account (accounts: {known})"
        ))
        .into());
    };
    account.home_timeline = cmd.home;

    let (activities, unparsed) = read_activities(&cmd.file)?;

    let mut materializer = ActivityMaterializer::new(db, config);
    let cancel = AtomicBool::new(false);
    let report = materializer.materialize_batch(&account, &activities, &cancel);

    println!(
        "Ingested {} activities ({} failed, {} unparsable), {} actors advanced",
        report.processed, report.failed, unparsed, report.index_entries_flushed
    );
    Ok(())
}

/// Parses one activity per non-empty line. Lines that do not parse are logged and counted.
fn read_activities(path: &Path) -> Result<(Vec<Activity>, usize)> {
    let input = std::fs::read_to_string(path)
        .map_err(|e| UserError(format!("cannot read {}: {e}", path.display())))?;

    let mut activities = Vec::new();
    let mut unparsed = 0;
    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Activity>(line) {
            Ok(activity) => activities.push(activity),
            Err(e) => {
                warn!(line = index + 1, "skipping unparsable activity: {e}");
                unparsed += 1;
            }
        }
    }
    Ok((activities, unparsed))
}

fn execute_repair(db: &Database, config: &EngineConfig) -> Result<()> {
    let report = repair_all(db, config)?;
    println!(
        "Scanned {} notes: {} conversations fixed, {} orphans cleared, {} unreachable, {} failed",
        report.scanned,
        report.conversations_fixed,
        report.orphans_cleared,
        report.unreachable,
        report.failed
    );
    Ok(())
}

fn execute_merge(db: &Database, config: &EngineConfig) -> Result<()> {
    let report = ActorMerger::new(db, config).merge_all()?;
    println!(
        "Merged {} of {} duplicate actors ({} failed, {} references repointed)",
        report.merged, report.candidates, report.failed, report.repointed
    );
    if !report.identity_index {
        println!("Duplicate actor identities remain; unique index not yet created");
    }
    Ok(())
}
