//! Testing utilities for migration development and verification for SQLite.
//!
//! [SqliteTestHarness] runs a migrations directory against an in-memory database and offers
//! assertion helpers for schema checks, data transformation tests and reversibility checks.

use crate::{Error, MigrationId, MigrationReport, Migrator, Outcome, Target};
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A test harness for SQLite migration testing that provides state control and assertion helpers.
///
/// # Example
///
/// ```ignore
/// use sqlshift::testing::sqlite::SqliteTestHarness;
/// use sqlshift::{MigrationId, Migrator};
///
/// let mut harness = SqliteTestHarness::new(Migrator::open("migrations")?)?;
///
/// // Migrate to a specific script
/// harness.migrate_to(MigrationId::new(20240101000000))?;
///
/// // Insert test data
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
///
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "alice");
///
/// // Every script can be applied and reverted without leaving anything behind
/// harness.assert_reversible()?;
/// ```
pub struct SqliteTestHarness {
    conn: Connection,
    migrator: Migrator,
}

/// The tables of a database, for comparison between two points in a migration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaState {
    pub tables: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub sql: String,
}

impl SqliteTestHarness {
    /// Create a harness over a fresh in-memory database.
    ///
    /// Build the migrator the same way production code does, so that tests exercise the real
    /// migrations directory.
    pub fn new(migrator: Migrator) -> Result<Self, Error> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            migrator,
        })
    }

    /// Create a test harness with a custom SQLite connection, e.g. a file-based database.
    pub fn with_connection(conn: Connection, migrator: Migrator) -> Self {
        Self { conn, migrator }
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Move to `target` in whichever direction it lies. A failing script is returned as an error.
    pub fn migrate_to(&mut self, target: impl Into<Target>) -> Result<MigrationReport, Error> {
        let report = self.migrator.migrate_to(&mut self.conn, target.into())?;
        Self::check(report)
    }

    /// Apply every pending script up to the current time.
    pub fn update(&mut self) -> Result<MigrationReport, Error> {
        let report = self.migrator.update(&mut self.conn, Target::Latest)?;
        Self::check(report)
    }

    /// Revert everything.
    pub fn rollback_all(&mut self) -> Result<MigrationReport, Error> {
        let report = self
            .migrator
            .rollback(&mut self.conn, Target::Identifier(MigrationId::NONE))?;
        Self::check(report)
    }

    /// Apply exactly the next pending script.
    pub fn migrate_up_one(&mut self) -> Result<MigrationReport, Error> {
        let next = self
            .migrator
            .pending(&mut self.conn)?
            .first()
            .map(|record| record.identifier)
            .ok_or_else(|| Error::Generic("No pending migration to apply".to_string()))?;
        self.migrate_to(next)
    }

    /// Revert exactly the latest applied script.
    pub fn migrate_down_one(&mut self) -> Result<MigrationReport, Error> {
        let applied = self.applied_identifiers()?;
        let Some((_, earlier)) = applied.split_last() else {
            return Err(Error::Generic("No applied migration to revert".to_string()));
        };
        let target = earlier.last().copied().unwrap_or(MigrationId::NONE);
        self.migrate_to(target)
    }

    fn check(report: MigrationReport) -> Result<MigrationReport, Error> {
        match (&report.outcome, &report.failing_migration) {
            (Outcome::Failed, Some(failure)) => Err(Error::Generic(format!(
                "Migration {} ({}) failed: {}",
                failure.identifier(),
                failure.script_reference(),
                failure.error()
            ))),
            (Outcome::UnknownSnapshot(label), _) => {
                Err(Error::Generic(format!("Unknown snapshot '{}'", label)))
            }
            _ => Ok(report),
        }
    }

    pub fn latest_identifier(&mut self) -> Result<MigrationId, Error> {
        self.migrator.latest_identifier(&mut self.conn)
    }

    pub fn applied_identifiers(&mut self) -> Result<Vec<MigrationId>, Error> {
        Ok(self
            .migrator
            .history(&mut self.conn)?
            .into_iter()
            .map(|record| record.identifier)
            .collect())
    }

    /// Execute SQL statements (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: rusqlite::types::FromSql,
    {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    fn count_objects(&mut self, kind: &str, name: &str) -> Result<i64, Error> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            [kind, name],
            |row| row.get(0),
        )?)
    }

    pub fn assert_table_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.count_objects("table", table_name)? == 0 {
            return Err(Error::Generic(format!(
                "Table '{}' does not exist",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.count_objects("table", table_name)? > 0 {
            return Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_index_exists(&mut self, index_name: &str) -> Result<(), Error> {
        if self.count_objects("index", index_name)? == 0 {
            return Err(Error::Generic(format!(
                "Index '{}' does not exist",
                index_name
            )));
        }
        Ok(())
    }

    pub fn assert_column_exists(
        &mut self,
        table_name: &str,
        column_name: &str,
    ) -> Result<(), Error> {
        let columns = self.get_columns(table_name)?;
        if !columns.iter().any(|c| c.name == column_name) {
            return Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    /// Capture every user table except the changelog.
    pub fn capture_schema(&mut self) -> Result<SchemaState, Error> {
        let changelog = self.migrator.changelog_table_name().to_string();
        let table_names: Vec<String> = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1",
            )?
            .query_map([&changelog], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = BTreeMap::new();
        for table_name in table_names {
            let columns = self.get_columns(&table_name)?;
            let indexes = self.get_indexes(&table_name)?;
            tables.insert(table_name, TableSchema { columns, indexes });
        }
        Ok(SchemaState { tables })
    }

    /// Assert that the current schema equals `expected`, listing the tables that differ.
    pub fn assert_schema_matches(&mut self, expected: &SchemaState) -> Result<(), Error> {
        let actual = self.capture_schema()?;
        if actual == *expected {
            return Ok(());
        }

        let mut differences = Vec::new();
        for (name, table) in &expected.tables {
            match actual.tables.get(name) {
                None => differences.push(format!("  - Table '{}' is missing", name)),
                Some(found) if found != table => differences.push(format!(
                    "  - Table '{}' differs:\n    Expected: {:?}\n    Actual:   {:?}",
                    name, table, found
                )),
                Some(_) => {}
            }
        }
        for name in actual.tables.keys() {
            if !expected.tables.contains_key(name) {
                differences.push(format!("  - Unexpected table '{}' found", name));
            }
        }
        Err(Error::Generic(format!(
            "Schema mismatch detected:\n{}",
            differences.join("\n")
        )))
    }

    /// Apply every pending script one at a time and revert it again, checking that each revert
    /// restores the schema it started from. Ends with all scripts applied.
    pub fn assert_reversible(&mut self) -> Result<(), Error> {
        while !self.migrator.pending(&mut self.conn)?.is_empty() {
            let before = self.capture_schema()?;
            self.migrate_up_one()?;
            let after = self.capture_schema()?;
            let applied = self.latest_identifier()?;

            self.migrate_down_one()?;
            self.assert_schema_matches(&before).map_err(|e| {
                Error::Generic(format!("Reverting migration {} is incomplete: {}", applied, e))
            })?;

            self.migrate_up_one()?;
            self.assert_schema_matches(&after)?;
        }
        Ok(())
    }

    fn get_columns(&mut self, table_name: &str) -> Result<Vec<ColumnInfo>, Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", table_name))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    type_name: row.get(2)?,
                    not_null: row.get::<_, i32>(3)? != 0,
                    default_value: row.get(4)?,
                    primary_key: row.get::<_, i32>(5)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn get_indexes(&mut self, table_name: &str) -> Result<Vec<IndexInfo>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name",
        )?;
        let indexes = stmt
            .query_map([table_name], |row| {
                let name: String = row.get(0)?;
                let sql: String = row.get(1)?;
                Ok(IndexInfo {
                    unique: sql.to_uppercase().contains("UNIQUE"),
                    name,
                    sql,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(indexes)
    }

    /// Get a reference to the underlying connection for advanced usage.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
