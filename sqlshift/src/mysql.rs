//! # MySQL support
//!
//! Implements [Database] for [mysql::Conn].
//!
//! DDL statements in MySQL cause an implicit commit and cannot be rolled back, so migrations are not
//! wrapped in a transaction on this backend. If a script fails halfway through, the statements before
//! the failing one stay applied and the migration is not recorded; fix the script (or the schema) and
//! run the update again.

use crate::changelog::{ChangelogRow, Database, Dialect, NewChangelogRow};
use crate::error::Error;
use mysql::prelude::*;
use mysql::Conn;

/// SQL text for MySQL and MariaDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

pub(crate) static MYSQL: MysqlDialect = MysqlDialect;

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn probe_changelog_table(&self) -> &'static str {
        "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?"
    }

    fn create_changelog_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                change_id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                identifier VARCHAR(20) NOT NULL UNIQUE,
                script_reference VARCHAR(255) NOT NULL,
                forward_query LONGTEXT NULL,
                reverse_query LONGTEXT NULL
            )",
            table
        )
    }

    fn select_applied(&self, table: &str) -> String {
        format!(
            "SELECT change_id, identifier, script_reference, forward_query, reverse_query,
                DATE_FORMAT(
                    IFNULL(CONVERT_TZ(created_at, @@session.time_zone, '+00:00'), created_at),
                    '%Y-%m-%d %H:%i:%s'
                )
             FROM {} ORDER BY identifier",
            table
        )
    }

    fn insert_applied(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, script_reference, forward_query, reverse_query) \
             VALUES (?, ?, ?, ?)",
            table
        )
    }

    fn delete_applied(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE change_id = ?", table)
    }

    fn transactional_ddl(&self) -> bool {
        false
    }
}

impl Database for Conn {
    fn dialect(&self) -> &'static dyn Dialect {
        &MYSQL
    }

    fn execute_query(&mut self, query: &str) -> Result<(), Error> {
        self.query_drop(query)?;
        Ok(())
    }

    fn probe_table(&mut self, table: &str) -> Result<bool, Error> {
        let found: Option<(i64,)> = self.exec_first(MYSQL.probe_changelog_table(), (table,))?;
        Ok(found.is_some())
    }

    fn select_changelog(&mut self, table: &str) -> Result<Vec<ChangelogRow>, Error> {
        let rows = self.query_map(
            MYSQL.select_applied(table),
            |(change_id, identifier, script_reference, forward_query, reverse_query, created_at): (
                i64,
                String,
                String,
                Option<String>,
                Option<String>,
                String,
            )| {
                ChangelogRow {
                    change_id,
                    identifier,
                    script_reference,
                    forward_query,
                    reverse_query,
                    created_at,
                }
            },
        )?;
        Ok(rows)
    }

    fn insert_changelog(&mut self, table: &str, row: &NewChangelogRow<'_>) -> Result<u64, Error> {
        self.exec_drop(
            MYSQL.insert_applied(table),
            (
                row.identifier.as_str(),
                row.script_reference,
                row.forward_query,
                row.reverse_query,
            ),
        )?;
        Ok(self.affected_rows())
    }

    fn delete_changelog(&mut self, table: &str, change_id: i64) -> Result<u64, Error> {
        self.exec_drop(MYSQL.delete_applied(table), (change_id,))?;
        Ok(self.affected_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_ddl_is_not_transactional() {
        assert!(!MYSQL.transactional_ddl());
        assert_eq!(MYSQL.name(), "mysql");
    }

    #[test]
    fn statements_target_the_configured_table() {
        assert!(MYSQL
            .create_changelog_table("my_log")
            .starts_with("CREATE TABLE IF NOT EXISTS my_log ("));
        assert!(MYSQL
            .select_applied("my_log")
            .contains("FROM my_log ORDER BY identifier"));
        assert_eq!(
            MYSQL.delete_applied("my_log"),
            "DELETE FROM my_log WHERE change_id = ?"
        );
    }
}
