use crate::error::Error;
use crate::repository::SkippedScript;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The name of the changelog table when none is configured.
pub const DEFAULT_CHANGELOG_TABLE_NAME: &str = "_schema_changelog";

/// Identifies a migration's position in history.
///
/// Identifiers are parsed from the leading all-digit token of a script's file name. Scripts created by
/// the generator use the UTC creation time in `YYYYMMDDHHMMSS` form, but any increasing sequence of
/// numbers works. [MigrationId::NONE] sorts below every real identifier and stands for
/// "no migration applied".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MigrationId(u64);

impl MigrationId {
    /// The identifier of an empty changelog.
    pub const NONE: MigrationId = MigrationId(0);

    /// Width of the zero-padded form stored in the changelog table (enough digits for any `u64`).
    pub const COLUMN_WIDTH: usize = 20;

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The next identifier in order, used when a freshly allocated identifier collides.
    pub const fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Build a `YYYYMMDDHHMMSS` identifier from a UTC instant.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let date = u64::from(at.year().unsigned_abs()) * 10_000_000_000
            + u64::from(at.month()) * 100_000_000
            + u64::from(at.day()) * 1_000_000;
        let time =
            u64::from(at.hour()) * 10_000 + u64::from(at.minute()) * 100 + u64::from(at.second());
        Self(date + time)
    }

    /// The fixed-width form persisted in the changelog, so that text order and numeric order agree.
    pub(crate) fn to_column(self) -> String {
        format!("{:0width$}", self.0, width = Self::COLUMN_WIDTH)
    }

    pub(crate) fn from_column(value: &str) -> Result<Self, Error> {
        value.trim().parse().map_err(|e: Error| {
            Error::Persistence(format!(
                "Invalid identifier '{}' in changelog table: {}",
                value, e
            ))
        })
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MigrationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Configuration(format!(
                "'{}' is not a migration identifier, expected digits only",
                s
            )));
        }
        s.parse::<u64>().map(MigrationId).map_err(|_| {
            Error::Configuration(format!("Migration identifier '{}' is out of range", s))
        })
    }
}

impl Serialize for MigrationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MigrationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A migration as the engine sees it: either pending on disk, or applied and recorded in the changelog.
///
/// Records read from disk never carry a `change_id`. The same migration is re-read from the changelog
/// after it has been applied rather than updated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub identifier: MigrationId,
    /// File name of the script, relative to the migrations directory.
    pub script_reference: String,
    /// The query executed when the migration was applied.
    pub forward_query: Option<String>,
    /// The query captured at apply time to undo the migration.
    pub reverse_query: Option<String>,
    /// Primary key of the changelog row, present only for applied migrations.
    pub change_id: Option<i64>,
    /// When the changelog row was written.
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    /// A migration found on disk that has not been applied.
    pub fn pending(identifier: MigrationId, script_reference: impl Into<String>) -> Self {
        Self {
            identifier,
            script_reference: script_reference.into(),
            forward_query: None,
            reverse_query: None,
            change_id: None,
            applied_at: None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.change_id.is_some()
    }

    /// The human part of the file name: `20240101000000-create-users.sql` yields `create-users`.
    pub fn label(&self) -> &str {
        let stem = self
            .script_reference
            .rsplit_once('.')
            .map_or(self.script_reference.as_str(), |(stem, _)| stem);
        stem.split_once('-').map_or("", |(_, label)| label)
    }
}

/// Which operation of a script is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Move the schema forward: run the script's apply section and record it.
    Apply,
    /// Undo a previously applied script: run its revert section and delete its record.
    Revert,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Apply => f.write_str("apply"),
            Direction::Revert => f.write_str("revert"),
        }
    }
}

/// The point in history an update or rollback should reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every migration up to the current time.
    Latest,
    /// A specific identifier. [MigrationId::NONE] means "before the first migration".
    Identifier(MigrationId),
    /// A snapshot label, resolved through the snapshot index.
    Snapshot(String),
}

impl From<MigrationId> for Target {
    fn from(value: MigrationId) -> Self {
        Target::Identifier(value)
    }
}

impl FromStr for Target {
    type Err = Error;

    /// `-1`, `now` and `latest` select [Target::Latest], digits select an identifier and anything else
    /// is taken as a snapshot label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Configuration("Empty migration target".to_string()));
        }
        if s == "-1" || s.eq_ignore_ascii_case("now") || s.eq_ignore_ascii_case("latest") {
            return Ok(Target::Latest);
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Target::Identifier(s.parse()?));
        }
        Ok(Target::Snapshot(s.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Latest => f.write_str("latest"),
            Target::Identifier(id) => write!(f, "{}", id),
            Target::Snapshot(label) => write!(f, "snapshot '{}'", label),
        }
    }
}

/// How an update or rollback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every selected migration ran and the changelog was updated.
    Done,
    /// A migration failed; see [MigrationReport::failing_migration].
    Failed,
    /// The database already is at the requested version, or nothing lies between it and the target.
    AlreadyAtTarget,
    /// The target named a snapshot that does not exist.
    UnknownSnapshot(String),
    /// An update resolved to a point before the latest applied migration, or a rollback to a point
    /// after it.
    WrongDirection,
}

/// Represents a failure during a migration.
#[derive(Debug, PartialEq)]
pub struct MigrationFailure {
    pub(crate) identifier: MigrationId,
    pub(crate) script_reference: String,
    pub(crate) error: Error,
}

impl MigrationFailure {
    /// Get the identifier of the migration that failed.
    pub fn identifier(&self) -> MigrationId {
        self.identifier
    }

    /// Get the file name of the migration that failed.
    pub fn script_reference(&self) -> &str {
        &self.script_reference
    }

    /// Get the error that caused the migration to fail.
    pub fn error(&self) -> &Error {
        &self.error
    }
}

/// A report of actions performed during an update or rollback.
#[derive(Debug, PartialEq)]
pub struct MigrationReport {
    pub changelog_table_existed: bool,
    pub changelog_table_created: bool,
    /// `None` when nothing was selected.
    pub direction: Option<Direction>,
    /// The resolved target, `None` if it could not be resolved.
    pub target: Option<MigrationId>,
    pub migrations_run: Vec<MigrationId>,
    pub failing_migration: Option<MigrationFailure>,
    /// Files in the migrations directory that were ignored because their name could not be parsed.
    pub skipped_scripts: Vec<SkippedScript>,
    pub outcome: Outcome,
}

impl MigrationReport {
    /// Whether every selected migration ran. Soft conditions such as "already at target" are `false`.
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Done
    }

    pub fn executed_count(&self) -> usize {
        self.migrations_run.len()
    }
}

/// Source of identifiers for new scripts and for [Target::Latest].
pub trait Clock {
    fn now(&self) -> MigrationId;
}

/// The wall clock, in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> MigrationId {
        MigrationId::from_datetime(Utc::now())
    }
}

impl<F> Clock for F
where
    F: Fn() -> MigrationId,
{
    fn now(&self) -> MigrationId {
        self()
    }
}

type StartHook = Box<dyn Fn(MigrationId, &str, Direction) + Send + Sync>;
type CompleteHook = Box<dyn Fn(MigrationId, &str, Direction, Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(MigrationId, &str, &Error) + Send + Sync>;
type SkippedHook = Box<dyn Fn(&SkippedScript) + Send + Sync>;

/// Observer callbacks shared by the engine and the execution driver.
#[derive(Default)]
pub(crate) struct Hooks {
    pub on_migration_start: Option<StartHook>,
    pub on_migration_complete: Option<CompleteHook>,
    pub on_migration_error: Option<ErrorHook>,
    pub on_script_skipped: Option<SkippedHook>,
}

// Manual Debug impl since closures don't implement Debug
impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .field("on_script_skipped", &self.on_script_skipped.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn started(&self, identifier: MigrationId, script: &str, direction: Direction) {
        if let Some(ref callback) = self.on_migration_start {
            callback(identifier, script, direction);
        }
    }

    pub fn completed(
        &self,
        identifier: MigrationId,
        script: &str,
        direction: Direction,
        duration: Duration,
    ) {
        if let Some(ref callback) = self.on_migration_complete {
            callback(identifier, script, direction, duration);
        }
    }

    pub fn failed(&self, identifier: MigrationId, script: &str, error: &Error) {
        if let Some(ref callback) = self.on_migration_error {
            callback(identifier, script, error);
        }
    }

    pub fn skipped(&self, script: &SkippedScript) {
        if let Some(ref callback) = self.on_script_skipped {
            callback(script);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn identifier_from_datetime_is_compact_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 13, 4, 5).unwrap();
        assert_eq!(
            MigrationId::from_datetime(at),
            MigrationId::new(20240102130405)
        );
    }

    #[test]
    fn identifier_column_form_is_fixed_width_and_round_trips() {
        let id = MigrationId::new(20240101000000);
        let column = id.to_column();
        assert_eq!(column.len(), MigrationId::COLUMN_WIDTH);
        assert_eq!(column, "00000020240101000000");
        assert_eq!(MigrationId::from_column(&column).unwrap(), id);

        // text order of the padded form follows numeric order
        assert!(MigrationId::new(99).to_column() < MigrationId::new(100).to_column());
    }

    #[test]
    fn identifier_rejects_non_digits() {
        assert!("2024a".parse::<MigrationId>().is_err());
        assert!("".parse::<MigrationId>().is_err());
        assert!("99999999999999999999999".parse::<MigrationId>().is_err());
        assert!(MigrationId::from_column("abc").is_err());
    }

    #[test]
    fn none_sorts_below_everything() {
        assert!(MigrationId::NONE < MigrationId::new(1));
        assert!(MigrationId::NONE.is_none());
        assert_eq!(MigrationId::NONE.successor(), MigrationId::new(1));
    }

    #[test]
    fn target_parsing() {
        assert_eq!("-1".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("now".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("LATEST".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!(
            "20240101000000".parse::<Target>().unwrap(),
            Target::Identifier(MigrationId::new(20240101000000))
        );
        assert_eq!(
            "0".parse::<Target>().unwrap(),
            Target::Identifier(MigrationId::NONE)
        );
        assert_eq!(
            "release-1.2".parse::<Target>().unwrap(),
            Target::Snapshot("release-1.2".to_string())
        );
        assert!(" ".parse::<Target>().is_err());
    }

    #[test]
    fn record_label_strips_identifier_and_extension() {
        let record = MigrationRecord::pending(
            MigrationId::new(20240101000000),
            "20240101000000-create-table-users.sql",
        );
        assert_eq!(record.label(), "create-table-users");
        assert!(!record.is_applied());

        let bare = MigrationRecord::pending(MigrationId::new(7), "7.sql");
        assert_eq!(bare.label(), "");
    }

    #[test]
    fn closures_are_clocks() {
        let clock = || MigrationId::new(42);
        assert_eq!(Clock::now(&clock), MigrationId::new(42));
    }

    #[test]
    fn report_success_only_when_done() {
        let mut report = MigrationReport {
            changelog_table_existed: true,
            changelog_table_created: false,
            direction: None,
            target: Some(MigrationId::new(1)),
            migrations_run: vec![],
            failing_migration: None,
            skipped_scripts: vec![],
            outcome: Outcome::AlreadyAtTarget,
        };
        assert!(!report.success());
        report.outcome = Outcome::Done;
        assert!(report.success());
        assert_eq!(report.executed_count(), 0);
    }
}
