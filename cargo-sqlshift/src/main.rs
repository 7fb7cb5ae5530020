//! Cargo subcommand for sqlshift database migrations.
//!
//! This binary provides the `cargo sqlshift` command, which runs the SQL scripts of the current
//! package against the database named by its configuration in `Cargo.toml`:
//!
//! ```toml
//! [package.metadata.sqlshift]
//! database = "postgres"
//! migrations_dir = "migrations"
//! ```

use std::path::PathBuf;

use cargo_metadata::MetadataCommand;
use clap::Parser;
use serde::Deserialize;
use sqlshift::{
    Database, MigrationReport, Migrator, Outcome, Plan, SnapshotOutcome, Target,
    DEFAULT_CHANGELOG_TABLE_NAME,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cargo")]
#[command(bin_name = "cargo")]
struct Cargo {
    #[command(subcommand)]
    command: CargoCommands,
}

#[derive(clap::Subcommand)]
enum CargoCommands {
    /// Run sqlshift database migrations
    Sqlshift(SqlshiftArgs),
}

#[derive(clap::Args)]
struct SqlshiftArgs {
    /// Migrations directory, overriding the package configuration
    #[arg(long)]
    dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create a new, empty migration script (no database required)
    Create { label: String },
    /// Apply pending migrations up to a target: an identifier, a snapshot label or "latest"
    Update {
        #[arg(default_value = "latest")]
        target: String,
    },
    /// Revert applied migrations newer than a target; everything by default
    Rollback {
        #[arg(default_value = "0")]
        target: String,
    },
    /// Move to a target in whichever direction it lies
    Migrate { target: String },
    /// Show what an update (or, with --rollback, a rollback) would run
    Preview {
        target: Option<String>,
        #[arg(long)]
        rollback: bool,
    },
    /// Record every migration not yet in a snapshot under a label (no database required)
    Snapshot { label: String },
    /// List snapshots (no database required)
    Snapshots,
    /// Show applied, pending and drifted migrations
    Status,
    /// Show applied migrations
    History,
    /// List migration scripts on disk (no database required)
    List,
}

#[derive(Debug, Deserialize)]
struct SqlshiftConfig {
    /// Database type: "sqlite", "postgres" or "mysql"
    database: String,
    /// Environment variable for database URL (default: "DATABASE_URL")
    #[serde(default = "default_database_url_env")]
    database_url_env: String,
    /// Directory holding the scripts, relative to the package (default: "migrations")
    #[serde(default = "default_migrations_dir")]
    migrations_dir: PathBuf,
    #[serde(default = "default_changelog_table")]
    changelog_table: String,
    /// Script file extension (default: "sql")
    extension: Option<String>,
}

fn default_database_url_env() -> String {
    "DATABASE_URL".to_string()
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_changelog_table() -> String {
    DEFAULT_CHANGELOG_TABLE_NAME.to_string()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Cargo {
        command: CargoCommands::Sqlshift(args),
    } = Cargo::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Get project metadata
    let metadata = MetadataCommand::new().no_deps().exec()?;
    let root_package = metadata
        .root_package()
        .ok_or("No root package found. Are you in a Cargo project directory?")?;

    let sqlshift_metadata = root_package
        .metadata
        .get("sqlshift")
        .ok_or("No [package.metadata.sqlshift] found in Cargo.toml. Please add configuration.")?;

    let config: SqlshiftConfig = serde_json::from_value(sqlshift_metadata.clone())
        .map_err(|e| format!("Invalid sqlshift config: {}", e))?;

    if !["sqlite", "postgres", "mysql"].contains(&config.database.as_str()) {
        return Err(format!(
            "Invalid database type '{}'. Must be 'sqlite', 'postgres' or 'mysql'.",
            config.database
        )
        .into());
    }

    let package_dir = root_package
        .manifest_path
        .parent()
        .ok_or("Could not determine package directory")?;
    let directory = args
        .dir
        .unwrap_or_else(|| package_dir.as_std_path().join(&config.migrations_dir));

    let mut migrator = Migrator::open(&directory)?
        .with_changelog_table_name(config.changelog_table.as_str())?
        .on_script_skipped(|skipped| {
            eprintln!("Skipping {}: {}", skipped.file_name, skipped.reason);
        });
    if let Some(extension) = &config.extension {
        migrator = migrator.with_extension(extension);
    }

    // Commands that don't need a database connection
    match &args.command {
        Command::Create { label } => {
            let file_name = migrator.create(label)?;
            println!("Created {}", directory.join(file_name).display());
            return Ok(());
        }
        Command::Snapshot { label } => {
            match migrator.snapshot(label)? {
                SnapshotOutcome::Created(snapshot) => println!(
                    "Snapshot '{}' created with {} migration(s)",
                    snapshot.label,
                    snapshot.migrations.len()
                ),
                SnapshotOutcome::NothingToCapture => {
                    println!("Every migration already belongs to a snapshot.")
                }
                SnapshotOutcome::Duplicate(label) => {
                    return Err(format!("Snapshot '{}' already exists", label).into())
                }
            }
            return Ok(());
        }
        Command::Snapshots => {
            let snapshots = migrator.snapshots()?;
            if snapshots.is_empty() {
                println!("No snapshots.");
            }
            for snapshot in snapshots {
                println!(
                    "{} (created {}): {}",
                    snapshot.label,
                    snapshot.created_at,
                    snapshot
                        .migrations
                        .values()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            return Ok(());
        }
        Command::List => {
            let scan = migrator.list_on_disk()?;
            if scan.migrations.is_empty() {
                println!("No migrations in {}.", directory.display());
            } else {
                println!("Migrations ({}):", scan.migrations.len());
                for m in &scan.migrations {
                    println!("  {}: {}", m.identifier, m.script_reference);
                }
            }
            return Ok(());
        }
        _ => {}
    }

    // Commands that need database access
    let database_url = std::env::var(&config.database_url_env)
        .map_err(|_| format!("Environment variable {} not set", config.database_url_env))?;

    match config.database.as_str() {
        "sqlite" => {
            let path = database_url
                .strip_prefix("sqlite://")
                .unwrap_or(&database_url);
            let mut conn = rusqlite::Connection::open(path)?;
            run(&migrator, &mut conn, args.command)
        }
        "postgres" => {
            let mut client = postgres::Client::connect(&database_url, postgres::NoTls)?;
            run(&migrator, &mut client, args.command)
        }
        _ => {
            let opts = mysql::Opts::from_url(&database_url)?;
            let mut conn = mysql::Conn::new(opts)?;
            run(&migrator, &mut conn, args.command)
        }
    }
}

fn run(
    migrator: &Migrator,
    db: &mut dyn Database,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Update { target } => report(migrator.update(db, target.parse()?)?),
        Command::Rollback { target } => report(migrator.rollback(db, target.parse()?)?),
        Command::Migrate { target } => report(migrator.migrate_to(db, target.parse()?)?),
        Command::Preview { target, rollback } => {
            let plan = match (target, rollback) {
                (Some(target), true) => migrator.preview_rollback(db, target.parse()?)?,
                (None, true) => migrator.preview_rollback(db, "0".parse()?)?,
                (target, false) => {
                    let target = match target {
                        Some(target) => target.parse()?,
                        None => Target::Latest,
                    };
                    migrator.preview_update(db, target)?
                }
            };
            print_plan(&plan);
            Ok(())
        }
        Command::Status => {
            let status = migrator.status(db)?;
            if status.latest.is_none() {
                println!("No migrations applied.");
            } else {
                println!(
                    "Latest applied migration: {} ({} applied)",
                    status.latest,
                    status.applied.len()
                );
            }
            println!("Pending: {}", status.pending.len());
            for m in &status.pending {
                println!("  {}", m.script_reference);
            }
            let sections = [
                ("Never applied, older than the latest", &status.out_of_order),
                ("Changed since applied", &status.drifted),
                ("Applied, file missing", &status.missing),
            ];
            for (title, records) in sections {
                if !records.is_empty() {
                    println!("{}:", title);
                    for m in records {
                        println!("  {}", m.script_reference);
                    }
                }
            }
            Ok(())
        }
        Command::History => {
            let history = migrator.history(db)?;
            if history.is_empty() {
                println!("No migrations applied.");
            }
            for m in history {
                let applied_at = m
                    .applied_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_default();
                println!("  {}: {} {}", m.identifier, m.script_reference, applied_at);
            }
            Ok(())
        }
        Command::Create { .. }
        | Command::Snapshot { .. }
        | Command::Snapshots
        | Command::List => Ok(()),
    }
}

fn report(report: MigrationReport) -> Result<(), Box<dyn std::error::Error>> {
    if report.changelog_table_created {
        println!("Created changelog table.");
    }
    match &report.outcome {
        Outcome::Done => {
            let direction = report
                .direction
                .map_or_else(String::new, |d| d.to_string());
            println!(
                "Done: {} migration(s) ({}).",
                report.executed_count(),
                direction
            );
            Ok(())
        }
        Outcome::AlreadyAtTarget => {
            println!("Already at the requested version.");
            Ok(())
        }
        Outcome::WrongDirection => Err(format!(
            "Target {} is on the other side of the latest applied migration",
            report
                .target
                .map_or_else(|| "?".to_string(), |t| t.to_string())
        )
        .into()),
        Outcome::UnknownSnapshot(label) => Err(format!("Unknown snapshot '{}'", label).into()),
        Outcome::Failed => {
            if !report.migrations_run.is_empty() {
                println!(
                    "{} migration(s) ran before the failure.",
                    report.executed_count()
                );
            }
            match &report.failing_migration {
                Some(failure) => Err(format!(
                    "Migration {} ({}) failed: {}",
                    failure.identifier(),
                    failure.script_reference(),
                    failure.error()
                )
                .into()),
                None => Err("Migration failed".into()),
            }
        }
    }
}

fn print_plan(plan: &Plan) {
    match plan {
        Plan::Apply { target, migrations } | Plan::Revert { target, migrations } => {
            let verb = if matches!(plan, Plan::Apply { .. }) {
                "apply"
            } else {
                "revert"
            };
            println!(
                "Would {} {} migration(s) to reach {}:",
                verb,
                migrations.len(),
                target
            );
            for m in migrations {
                println!("  {}", m.script_reference);
            }
        }
        Plan::NoOp { target } => println!("Nothing to do, already at {}.", target),
        Plan::WrongDirection { target } => println!(
            "Target {} is on the other side of the latest applied migration.",
            target
        ),
        Plan::UnknownSnapshot(label) => println!("Unknown snapshot '{}'.", label),
    }
}
