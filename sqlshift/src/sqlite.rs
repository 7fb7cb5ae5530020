//! # SQLite support
//!
//! Implements [Database] for [rusqlite::Connection].
//!
//! SQLite supports transactional DDL, so every migration runs in its own transaction together with its
//! changelog bookkeeping. A failing script leaves the database exactly as it was after the previous
//! migration.
//!
//! ## Example
//!
//! ```ignore
//! use rusqlite::Connection;
//! use sqlshift::{Migrator, Target};
//!
//! let migrator = Migrator::open("migrations")?;
//! let mut conn = Connection::open("app.db")?;
//! let report = migrator.update(&mut conn, Target::Latest)?;
//! ```

use crate::changelog::{ChangelogRow, Database, Dialect, NewChangelogRow};
use crate::error::Error;
use rusqlite::{params, Connection};

/// SQL text for SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

pub(crate) static SQLITE: SqliteDialect = SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn probe_changelog_table(&self) -> &'static str {
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1"
    }

    fn create_changelog_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                change_id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                identifier VARCHAR(20) NOT NULL UNIQUE,
                script_reference VARCHAR(255) NOT NULL,
                forward_query TEXT,
                reverse_query TEXT
            )",
            table
        )
    }

    fn select_applied(&self, table: &str) -> String {
        format!(
            "SELECT change_id, identifier, script_reference, forward_query, reverse_query, created_at
             FROM {} ORDER BY identifier",
            table
        )
    }

    fn insert_applied(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, script_reference, forward_query, reverse_query)
             VALUES (?1, ?2, ?3, ?4)",
            table
        )
    }

    fn delete_applied(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE change_id = ?1", table)
    }

    fn transactional_ddl(&self) -> bool {
        true
    }
}

impl Database for Connection {
    fn dialect(&self) -> &'static dyn Dialect {
        &SQLITE
    }

    fn execute_query(&mut self, query: &str) -> Result<(), Error> {
        self.execute_batch(query)?;
        Ok(())
    }

    fn probe_table(&mut self, table: &str) -> Result<bool, Error> {
        let mut stmt = self.prepare(SQLITE.probe_changelog_table())?;
        Ok(stmt.exists([table])?)
    }

    fn select_changelog(&mut self, table: &str) -> Result<Vec<ChangelogRow>, Error> {
        let mut stmt = self.prepare(&SQLITE.select_applied(table))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChangelogRow {
                    change_id: row.get(0)?,
                    identifier: row.get(1)?,
                    script_reference: row.get(2)?,
                    forward_query: row.get(3)?,
                    reverse_query: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_changelog(&mut self, table: &str, row: &NewChangelogRow<'_>) -> Result<u64, Error> {
        let written = self.execute(
            &SQLITE.insert_applied(table),
            params![
                row.identifier,
                row.script_reference,
                row.forward_query,
                row.reverse_query
            ],
        )?;
        Ok(written as u64)
    }

    fn delete_changelog(&mut self, table: &str, change_id: i64) -> Result<u64, Error> {
        let deleted = self.execute(&SQLITE.delete_applied(table), params![change_id])?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sees_created_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(!conn.probe_table("things").unwrap());
        conn.execute_query(&SQLITE.create_changelog_table("things")).unwrap();
        assert!(conn.probe_table("things").unwrap());
        // the DDL is idempotent
        conn.execute_query(&SQLITE.create_changelog_table("things")).unwrap();
    }

    #[test]
    fn execute_query_runs_multiple_statements() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_query(
            "CREATE TABLE a (id INTEGER); INSERT INTO a VALUES (1); INSERT INTO a VALUES (2);",
        )
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM a", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn execute_query_reports_errors() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = conn.execute_query("THIS IS NOT VALID SQL");
        assert!(matches!(result, Err(Error::Rusqlite(_))));
    }

    #[test]
    fn rolled_back_transaction_discards_ddl() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.begin_transaction().unwrap();
        conn.execute_query("CREATE TABLE scratch (id INTEGER)").unwrap();
        conn.rollback_transaction().unwrap();
        assert!(!conn.probe_table("scratch").unwrap());
    }

    #[test]
    fn insert_select_delete() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_query(&SQLITE.create_changelog_table("log"))
            .unwrap();
        let written = conn
            .insert_changelog(
                "log",
                &NewChangelogRow {
                    identifier: "00000000000000000100".to_string(),
                    script_reference: "100-a.sql",
                    forward_query: Some("CREATE TABLE a (id INT)"),
                    reverse_query: None,
                },
            )
            .unwrap();
        assert_eq!(written, 1);

        let rows = conn.select_changelog("log").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].script_reference, "100-a.sql");
        assert_eq!(rows[0].reverse_query, None);
        assert_eq!(rows[0].created_at.len(), "YYYY-MM-DD HH:MM:SS".len());

        assert_eq!(conn.delete_changelog("log", rows[0].change_id).unwrap(), 1);
        assert_eq!(conn.delete_changelog("log", rows[0].change_id).unwrap(), 0);
    }
}
