use crate::changelog::{Changelog, Database};
use crate::core::{
    Clock, Direction, Hooks, MigrationId, MigrationRecord, MigrationReport, Outcome, SystemClock,
    Target, DEFAULT_CHANGELOG_TABLE_NAME,
};
use crate::driver::ExecutionDriver;
use crate::error::Error;
use crate::generator;
use crate::repository::{Scan, ScriptRepository, SkippedScript};
use crate::script::Script;
use crate::snapshot::{Snapshot, SnapshotIndex, SnapshotOutcome, DEFAULT_SNAPSHOT_FILE_NAME};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Which way an operation is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Update,
    Rollback,
    Either,
}

/// What an update or rollback would do, computed without touching the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Apply these on-disk migrations, oldest first.
    Apply {
        target: MigrationId,
        migrations: Vec<MigrationRecord>,
    },
    /// Revert these applied migrations, newest first.
    Revert {
        target: MigrationId,
        migrations: Vec<MigrationRecord>,
    },
    /// Already at the target, or nothing lies between the latest applied migration and the target.
    NoOp { target: MigrationId },
    /// An update to an older point, or a rollback to a newer one.
    WrongDirection { target: MigrationId },
    UnknownSnapshot(String),
}

impl Plan {
    pub fn target(&self) -> Option<MigrationId> {
        match self {
            Plan::Apply { target, .. }
            | Plan::Revert { target, .. }
            | Plan::NoOp { target }
            | Plan::WrongDirection { target } => Some(*target),
            Plan::UnknownSnapshot(_) => None,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            Plan::Apply { .. } => Some(Direction::Apply),
            Plan::Revert { .. } => Some(Direction::Revert),
            _ => None,
        }
    }

    /// The migrations that would run, in execution order.
    pub fn migrations(&self) -> &[MigrationRecord] {
        match self {
            Plan::Apply { migrations, .. } | Plan::Revert { migrations, .. } => migrations,
            _ => &[],
        }
    }
}

/// A comparison of the migrations directory with the changelog.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub latest: MigrationId,
    pub applied: Vec<MigrationRecord>,
    /// On disk, newer than `latest`: what an update to the latest version would apply.
    pub pending: Vec<MigrationRecord>,
    /// On disk and never applied, but older than `latest`. An update will not pick these up.
    pub out_of_order: Vec<MigrationRecord>,
    /// Applied, but the script's apply section no longer matches the query that was executed.
    pub drifted: Vec<MigrationRecord>,
    /// Applied, but the script file is gone.
    pub missing: Vec<MigrationRecord>,
    pub skipped: Vec<SkippedScript>,
}

/// The entrypoint for creating, applying and reverting migrations stored in one directory.
///
/// Migrations are SQL files named `<identifier>-<label>.sql`; see [crate::script] for their layout.
/// Every operation that touches the database takes the connection explicitly, so one `Migrator` can
/// be used with any [Database].
///
/// ```ignore
/// use sqlshift::{Migrator, Target};
///
/// let migrator = Migrator::open("migrations")?
///     .with_changelog_table_name("schema_changes")?
///     .on_migration_complete(|id, script, direction, duration| {
///         println!("{} {} ({}) in {:?}", direction, script, id, duration);
///     });
///
/// let report = migrator.update(&mut conn, Target::Latest)?;
/// if !report.success() {
///     eprintln!("{:?}", report.outcome);
/// }
/// ```
pub struct Migrator {
    repository: ScriptRepository,
    snapshots: SnapshotIndex,
    changelog: Changelog,
    clock: Box<dyn Clock + Send + Sync>,
    hooks: Hooks,
}

// Manual Debug impl since the clock is a trait object
impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("repository", &self.repository)
            .field("snapshots", &self.snapshots)
            .field("changelog", &self.changelog)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Migrator {
    /// Open a migrations directory. The directory must exist.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, Error> {
        let directory = directory.as_ref();
        let repository = ScriptRepository::open(directory)?;
        Ok(Self {
            snapshots: SnapshotIndex::new(directory.join(DEFAULT_SNAPSHOT_FILE_NAME)),
            repository,
            changelog: Changelog::new(DEFAULT_CHANGELOG_TABLE_NAME)?,
            clock: Box::new(SystemClock),
            hooks: Hooks::default(),
        })
    }

    /// Set the extension of script files. Defaults to `sql`.
    pub fn with_extension(mut self, extension: impl AsRef<str>) -> Self {
        self.repository = self.repository.with_extension(extension);
        self
    }

    /// Set a custom name for the changelog table.
    /// Defaults to "_schema_changelog".
    pub fn with_changelog_table_name(mut self, name: impl Into<String>) -> Result<Self, Error> {
        self.changelog = Changelog::new(name)?;
        Ok(self)
    }

    /// Set the snapshot file, relative to the migrations directory. Defaults to `snapshots.jsonl`.
    pub fn with_snapshot_file_name(mut self, name: impl AsRef<Path>) -> Self {
        self.snapshots = SnapshotIndex::new(self.repository.directory().join(name));
        self
    }

    /// Replace the clock used for new identifiers and for [Target::Latest].
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// Set a callback to be invoked when a migration starts.
    /// The callback receives the migration identifier, script file name and direction.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(MigrationId, &str, Direction) + Send + Sync + 'static,
    {
        self.hooks.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration completes successfully.
    /// The callback receives the migration identifier, script file name, direction and duration.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(MigrationId, &str, Direction, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration fails.
    /// The callback receives the migration identifier, script file name and error.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(MigrationId, &str, &Error) + Send + Sync + 'static,
    {
        self.hooks.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked for every file in the migrations directory that has the script
    /// extension but no valid identifier.
    pub fn on_script_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SkippedScript) + Send + Sync + 'static,
    {
        self.hooks.on_script_skipped = Some(Box::new(callback));
        self
    }

    pub fn directory(&self) -> &Path {
        self.repository.directory()
    }

    pub fn changelog_table_name(&self) -> &str {
        self.changelog.table()
    }

    pub fn snapshot_file(&self) -> &Path {
        self.snapshots.path()
    }

    /// Write a new, empty script and return its file name.
    pub fn create(&self, label: &str) -> Result<String, Error> {
        generator::create_script(&self.repository, label, self.clock.as_ref())
    }

    /// Apply every on-disk migration newer than the latest applied one, up to and including `target`.
    ///
    /// A target older than the latest applied migration is not reverted; the report's outcome is
    /// [Outcome::WrongDirection]. A snapshot target resolves to the newest migration it captured.
    pub fn update(&self, db: &mut dyn Database, target: Target) -> Result<MigrationReport, Error> {
        self.execute(db, &target, Mode::Update)
    }

    /// Revert every applied migration newer than `target`, newest first.
    ///
    /// A snapshot target resolves to the oldest migration it captured, which stays applied.
    /// `Target::Identifier(MigrationId::NONE)` reverts everything.
    pub fn rollback(
        &self,
        db: &mut dyn Database,
        target: Target,
    ) -> Result<MigrationReport, Error> {
        self.execute(db, &target, Mode::Rollback)
    }

    /// Move to `target` in whichever direction it lies.
    pub fn migrate_to(
        &self,
        db: &mut dyn Database,
        target: Target,
    ) -> Result<MigrationReport, Error> {
        self.execute(db, &target, Mode::Either)
    }

    /// Preview which migrations `update(target)` would run, in the order they would run.
    pub fn preview_update(&self, db: &mut dyn Database, target: Target) -> Result<Plan, Error> {
        self.preview_with(db, &target, Mode::Update)
    }

    /// Preview which migrations `rollback(target)` would revert, in the order they would run.
    pub fn preview_rollback(&self, db: &mut dyn Database, target: Target) -> Result<Plan, Error> {
        self.preview_with(db, &target, Mode::Rollback)
    }

    /// Preview `migrate_to(target)`.
    pub fn preview(&self, db: &mut dyn Database, target: Target) -> Result<Plan, Error> {
        self.preview_with(db, &target, Mode::Either)
    }

    /// Capture every on-disk migration that no earlier snapshot contains under `label`.
    pub fn snapshot(&self, label: &str) -> Result<SnapshotOutcome, Error> {
        let on_disk: BTreeMap<MigrationId, String> = self
            .scan()?
            .migrations
            .into_iter()
            .map(|record| (record.identifier, record.script_reference))
            .collect();
        self.snapshots.append(label, &on_disk, self.clock.now())
    }

    pub fn snapshots(&self) -> Result<Vec<Snapshot>, Error> {
        self.snapshots.list()
    }

    /// Scan the migrations directory.
    pub fn list_on_disk(&self) -> Result<Scan, Error> {
        self.repository.list_on_disk()
    }

    /// Applied migrations, oldest first. Empty if the changelog table does not exist.
    pub fn history(&self, db: &mut dyn Database) -> Result<Vec<MigrationRecord>, Error> {
        self.changelog.list_applied(db)
    }

    /// The highest applied identifier, or [MigrationId::NONE].
    pub fn latest_identifier(&self, db: &mut dyn Database) -> Result<MigrationId, Error> {
        self.changelog.latest_identifier(db)
    }

    /// On-disk migrations newer than the latest applied one.
    pub fn pending(&self, db: &mut dyn Database) -> Result<Vec<MigrationRecord>, Error> {
        let latest = self.changelog.latest_identifier(db)?;
        Ok(self
            .repository
            .list_on_disk()?
            .migrations
            .into_iter()
            .filter(|record| record.identifier > latest)
            .collect())
    }

    pub fn status(&self, db: &mut dyn Database) -> Result<Status, Error> {
        let applied = self.changelog.list_applied(db)?;
        let latest = applied
            .last()
            .map_or(MigrationId::NONE, |record| record.identifier);
        let scan = self.repository.list_on_disk()?;

        let applied_ids: BTreeSet<MigrationId> =
            applied.iter().map(|record| record.identifier).collect();
        let (pending, out_of_order): (Vec<_>, Vec<_>) = scan
            .migrations
            .into_iter()
            .filter(|record| !applied_ids.contains(&record.identifier))
            .partition(|record| record.identifier > latest);

        let mut drifted = Vec::new();
        let mut missing = Vec::new();
        for record in &applied {
            match self.repository.load(&record.script_reference)? {
                Some(script) => {
                    let stored = record.forward_query.as_deref().unwrap_or_default();
                    if script.apply().trim() != stored.trim() {
                        drifted.push(record.clone());
                    }
                }
                None => missing.push(record.clone()),
            }
        }

        Ok(Status {
            latest,
            applied,
            pending,
            out_of_order,
            drifted,
            missing,
            skipped: scan.skipped,
        })
    }

    fn scan(&self) -> Result<Scan, Error> {
        let scan = self.repository.list_on_disk()?;
        for skipped in &scan.skipped {
            self.hooks.skipped(skipped);
        }
        Ok(scan)
    }

    fn preview_with(
        &self,
        db: &mut dyn Database,
        target: &Target,
        mode: Mode,
    ) -> Result<Plan, Error> {
        let scan = self.repository.list_on_disk()?;
        self.plan(db, target, mode, &scan.migrations)
    }

    fn plan(
        &self,
        db: &mut dyn Database,
        target: &Target,
        mode: Mode,
        on_disk: &[MigrationRecord],
    ) -> Result<Plan, Error> {
        let resolved = match target {
            Target::Latest => self.clock.now(),
            Target::Identifier(identifier) => *identifier,
            Target::Snapshot(label) => match self.snapshots.find(label)? {
                Some(snapshot) => {
                    let edge = match mode {
                        Mode::Rollback => snapshot.first(),
                        Mode::Update | Mode::Either => snapshot.last(),
                    };
                    edge.unwrap_or(snapshot.created_at)
                }
                None => return Ok(Plan::UnknownSnapshot(label.clone())),
            },
        };

        let applied = self.changelog.list_applied(db)?;
        let latest = applied
            .last()
            .map_or(MigrationId::NONE, |record| record.identifier);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            resolved = %resolved,
            latest = %latest,
            on_disk = on_disk.len(),
            applied = applied.len(),
            "Selecting migrations"
        );

        Ok(select_range(mode, latest, resolved, on_disk, &applied))
    }

    fn execute(
        &self,
        db: &mut dyn Database,
        target: &Target,
        mode: Mode,
    ) -> Result<MigrationReport, Error> {
        let table = self.changelog.ensure_table_exists(db)?;
        let scan = self.scan()?;
        let plan = self.plan(db, target, mode, &scan.migrations)?;

        let mut report = MigrationReport {
            changelog_table_existed: table.existed,
            changelog_table_created: table.created,
            direction: plan.direction(),
            target: plan.target(),
            migrations_run: vec![],
            failing_migration: None,
            skipped_scripts: scan.skipped,
            outcome: Outcome::Done,
        };

        let (migrations, direction) = match plan {
            Plan::Apply { migrations, .. } => (migrations, Direction::Apply),
            Plan::Revert { migrations, .. } => (migrations, Direction::Revert),
            Plan::NoOp { .. } => {
                #[cfg(feature = "tracing")]
                tracing::info!(resolved = ?report.target, "Already at requested version");
                report.outcome = Outcome::AlreadyAtTarget;
                return Ok(report);
            }
            Plan::WrongDirection { .. } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    resolved = ?report.target,
                    mode = ?mode,
                    "Target lies in the other direction"
                );
                report.outcome = Outcome::WrongDirection;
                return Ok(report);
            }
            Plan::UnknownSnapshot(label) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(snapshot = %label, "Unknown snapshot");
                report.outcome = Outcome::UnknownSnapshot(label);
                return Ok(report);
            }
        };

        let driver = ExecutionDriver {
            repository: &self.repository,
            changelog: &self.changelog,
            hooks: &self.hooks,
        };
        let outcome = driver.run(db, &migrations, direction)?;

        report.migrations_run = outcome.executed;
        report.outcome = if outcome.failure.is_some() {
            Outcome::Failed
        } else {
            Outcome::Done
        };
        report.failing_migration = outcome.failure;

        #[cfg(feature = "tracing")]
        tracing::info!(
            direction = %direction,
            executed = report.migrations_run.len(),
            selected = migrations.len(),
            success = report.success(),
            "Run finished"
        );

        Ok(report)
    }
}

/// Choose the migrations between `latest` and `target`.
///
/// Applying selects on-disk records with `latest < id <= target`, ascending. Reverting selects applied
/// records with `target < id <= latest`, descending.
fn select_range(
    mode: Mode,
    latest: MigrationId,
    target: MigrationId,
    on_disk: &[MigrationRecord],
    applied: &[MigrationRecord],
) -> Plan {
    match target.cmp(&latest) {
        Ordering::Equal => Plan::NoOp { target },
        Ordering::Greater if mode == Mode::Rollback => Plan::WrongDirection { target },
        Ordering::Less if mode == Mode::Update => Plan::WrongDirection { target },
        Ordering::Greater => {
            let mut migrations: Vec<MigrationRecord> = on_disk
                .iter()
                .filter(|record| record.identifier > latest && record.identifier <= target)
                .cloned()
                .collect();
            migrations.sort_by_key(|record| record.identifier);
            if migrations.is_empty() {
                Plan::NoOp { target }
            } else {
                Plan::Apply { target, migrations }
            }
        }
        Ordering::Less => {
            let mut migrations: Vec<MigrationRecord> = applied
                .iter()
                .filter(|record| record.identifier > target && record.identifier <= latest)
                .cloned()
                .collect();
            migrations.sort_by_key(|record| Reverse(record.identifier));
            if migrations.is_empty() {
                Plan::NoOp { target }
            } else {
                Plan::Revert { target, migrations }
            }
        }
    }
}
