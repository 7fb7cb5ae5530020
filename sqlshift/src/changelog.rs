//! The changelog table: the persisted ledger of applied migrations.
//!
//! [Changelog] is the only code that writes to the table. Backends plug in through two traits:
//! [Dialect] supplies the SQL text for one database flavour, and [Database] is implemented for a
//! connection type and executes that SQL with the driver's own parameter binding.

use crate::core::{MigrationId, MigrationRecord};
use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Format of `created_at` as every backend selects it.
pub(crate) const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQL text for one database flavour.
pub trait Dialect: Sync {
    fn name(&self) -> &'static str;

    /// A query taking the table name as its only parameter, returning a row if the table exists.
    fn probe_changelog_table(&self) -> &'static str;

    /// Idempotent DDL creating the changelog table.
    fn create_changelog_table(&self, table: &str) -> String;

    /// Selects `change_id, identifier, script_reference, forward_query, reverse_query, created_at`,
    /// with `created_at` rendered in UTC as `YYYY-MM-DD HH:MM:SS`.
    fn select_applied(&self, table: &str) -> String;

    /// Inserts `identifier, script_reference, forward_query, reverse_query`, in that order.
    fn insert_applied(&self, table: &str) -> String;

    /// Deletes one row by `change_id`.
    fn delete_applied(&self, table: &str) -> String;

    /// Whether DDL statements can be rolled back as part of a transaction.
    fn transactional_ddl(&self) -> bool;
}

/// A row of the changelog table as read back from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangelogRow {
    pub change_id: i64,
    pub identifier: String,
    pub script_reference: String,
    pub forward_query: Option<String>,
    pub reverse_query: Option<String>,
    pub created_at: String,
}

/// A row about to be inserted. Empty queries are stored as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChangelogRow<'a> {
    pub identifier: String,
    pub script_reference: &'a str,
    pub forward_query: Option<&'a str>,
    pub reverse_query: Option<&'a str>,
}

/// A connection the migrator can run against.
///
/// Implemented for `rusqlite::Connection`, `postgres::Client` and `mysql::Conn` behind their
/// respective features.
pub trait Database {
    fn dialect(&self) -> &'static dyn Dialect;

    /// Run one or more statements, discarding any result.
    fn execute_query(&mut self, query: &str) -> Result<(), Error>;

    fn probe_table(&mut self, table: &str) -> Result<bool, Error>;

    fn select_changelog(&mut self, table: &str) -> Result<Vec<ChangelogRow>, Error>;

    /// Returns the number of rows written.
    fn insert_changelog(&mut self, table: &str, row: &NewChangelogRow<'_>) -> Result<u64, Error>;

    /// Returns the number of rows deleted.
    fn delete_changelog(&mut self, table: &str, change_id: i64) -> Result<u64, Error>;

    fn begin_transaction(&mut self) -> Result<(), Error> {
        self.execute_query("BEGIN")
    }

    fn commit_transaction(&mut self) -> Result<(), Error> {
        self.execute_query("COMMIT")
    }

    fn rollback_transaction(&mut self) -> Result<(), Error> {
        self.execute_query("ROLLBACK")
    }
}

/// Whether [Changelog::ensure_table_exists] found or made the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStatus {
    pub existed: bool,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct Changelog {
    table: String,
}

impl Changelog {
    /// The table name is interpolated into SQL, so only ASCII letters, digits and `_` are accepted.
    pub fn new(table: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        if table.is_empty()
            || table.starts_with(|c: char| c.is_ascii_digit())
            || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Configuration(format!(
                "Invalid changelog table name '{}'",
                table
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if it is missing.
    ///
    /// A failing create is tolerated when the table exists afterwards, which is what happens when
    /// another process created it first.
    pub fn ensure_table_exists(&self, db: &mut dyn Database) -> Result<TableStatus, Error> {
        if self.exists(db)? {
            return Ok(TableStatus {
                existed: true,
                created: false,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            table = %self.table,
            backend = db.dialect().name(),
            "Creating changelog table"
        );

        let ddl = db.dialect().create_changelog_table(&self.table);
        match db.execute_query(&ddl) {
            Ok(()) => Ok(TableStatus {
                existed: false,
                created: true,
            }),
            Err(error) => {
                if self.exists(db)? {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %error, "Changelog table was created concurrently");
                    Ok(TableStatus {
                        existed: false,
                        created: false,
                    })
                } else {
                    Err(Error::Persistence(format!(
                        "Failed to create changelog table {}: {}",
                        self.table, error
                    )))
                }
            }
        }
    }

    fn exists(&self, db: &mut dyn Database) -> Result<bool, Error> {
        db.probe_table(&self.table).map_err(|e| {
            Error::Persistence(format!(
                "Failed to check for changelog table {}: {}",
                self.table, e
            ))
        })
    }

    /// Applied migrations in ascending identifier order. Empty if the table does not exist yet.
    pub fn list_applied(&self, db: &mut dyn Database) -> Result<Vec<MigrationRecord>, Error> {
        if !self.exists(db)? {
            return Ok(vec![]);
        }
        let rows = db.select_changelog(&self.table).map_err(|e| {
            Error::Persistence(format!(
                "Failed to read changelog table {}: {}",
                self.table, e
            ))
        })?;

        let mut records = rows
            .into_iter()
            .map(|row| {
                Ok(MigrationRecord {
                    identifier: MigrationId::from_column(&row.identifier)?,
                    script_reference: row.script_reference,
                    forward_query: row.forward_query,
                    reverse_query: row.reverse_query,
                    change_id: Some(row.change_id),
                    applied_at: Some(parse_created_at(&row.created_at)?),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        records.sort_by_key(|record| record.identifier);
        Ok(records)
    }

    /// The highest applied identifier, or [MigrationId::NONE].
    pub fn latest_identifier(&self, db: &mut dyn Database) -> Result<MigrationId, Error> {
        Ok(self
            .list_applied(db)?
            .last()
            .map_or(MigrationId::NONE, |record| record.identifier))
    }

    pub fn record_applied(
        &self,
        db: &mut dyn Database,
        identifier: MigrationId,
        script_reference: &str,
        forward_query: &str,
        reverse_query: &str,
    ) -> Result<(), Error> {
        let row = NewChangelogRow {
            identifier: identifier.to_column(),
            script_reference,
            forward_query: Some(forward_query).filter(|q| !q.is_empty()),
            reverse_query: Some(reverse_query).filter(|q| !q.is_empty()),
        };
        let written = db.insert_changelog(&self.table, &row).map_err(|e| {
            Error::Persistence(format!(
                "Failed to record migration {} ({}): {}",
                identifier, script_reference, e
            ))
        })?;
        if written != 1 {
            return Err(Error::Persistence(format!(
                "Recording migration {} wrote {} rows",
                identifier, written
            )));
        }
        Ok(())
    }

    /// Delete exactly one row. Zero rows means the changelog changed underneath us.
    pub fn remove_applied(&self, db: &mut dyn Database, change_id: i64) -> Result<(), Error> {
        let deleted = db.delete_changelog(&self.table, change_id).map_err(|e| {
            Error::Persistence(format!(
                "Failed to remove changelog row {}: {}",
                change_id, e
            ))
        })?;
        match deleted {
            1 => Ok(()),
            0 => Err(Error::Persistence(format!(
                "Changelog row {} no longer exists in {}",
                change_id, self.table
            ))),
            n => Err(Error::Persistence(format!(
                "Removing changelog row {} deleted {} rows",
                change_id, n
            ))),
        }
    }
}

fn parse_created_at(value: &str) -> Result<DateTime<Utc>, Error> {
    NaiveDateTime::parse_from_str(value.trim(), CREATED_AT_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            Error::Persistence(format!(
                "Invalid created_at '{}' in changelog table: {}",
                value, e
            ))
        })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn changelog() -> Changelog {
        Changelog::new(crate::core::DEFAULT_CHANGELOG_TABLE_NAME).unwrap()
    }

    #[test]
    fn rejects_unsafe_table_names() {
        assert!(Changelog::new("changes; DROP TABLE x").is_err());
        assert!(Changelog::new("").is_err());
        assert!(Changelog::new("1abc").is_err());
        assert!(Changelog::new("_my_changes_2").is_ok());
    }

    #[test]
    fn ensure_table_exists_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = changelog();

        let first = changelog.ensure_table_exists(&mut conn).unwrap();
        assert_eq!(
            first,
            TableStatus {
                existed: false,
                created: true
            }
        );
        let second = changelog.ensure_table_exists(&mut conn).unwrap();
        assert_eq!(
            second,
            TableStatus {
                existed: true,
                created: false
            }
        );
    }

    /// Reports every CREATE as failed. With `create_lands` the statement still runs first, as when
    /// another process wins the race to create the table.
    struct RacingCreate {
        conn: Connection,
        create_lands: bool,
        probes: usize,
    }

    impl RacingCreate {
        fn new(create_lands: bool) -> Self {
            Self {
                conn: Connection::open_in_memory().unwrap(),
                create_lands,
                probes: 0,
            }
        }
    }

    impl Database for RacingCreate {
        fn dialect(&self) -> &'static dyn Dialect {
            self.conn.dialect()
        }

        fn execute_query(&mut self, query: &str) -> Result<(), Error> {
            if query.contains("CREATE TABLE") {
                if self.create_lands {
                    self.conn.execute_query(query)?;
                }
                return Err(Error::Generic("table already exists".to_string()));
            }
            self.conn.execute_query(query)
        }

        fn probe_table(&mut self, table: &str) -> Result<bool, Error> {
            self.probes += 1;
            self.conn.probe_table(table)
        }

        fn select_changelog(&mut self, table: &str) -> Result<Vec<ChangelogRow>, Error> {
            self.conn.select_changelog(table)
        }

        fn insert_changelog(
            &mut self,
            table: &str,
            row: &NewChangelogRow<'_>,
        ) -> Result<u64, Error> {
            self.conn.insert_changelog(table, row)
        }

        fn delete_changelog(&mut self, table: &str, change_id: i64) -> Result<u64, Error> {
            self.conn.delete_changelog(table, change_id)
        }
    }

    #[test]
    fn concurrently_created_table_is_accepted() {
        let mut db = RacingCreate::new(true);
        let changelog = changelog();

        let status = changelog.ensure_table_exists(&mut db).unwrap();
        assert_eq!(
            status,
            TableStatus {
                existed: false,
                created: false
            }
        );
        assert_eq!(db.probes, 2);

        // the table is usable afterwards
        changelog
            .record_applied(&mut db, MigrationId::new(1), "1-a.sql", "", "")
            .unwrap();
        assert_eq!(changelog.list_applied(&mut db).unwrap().len(), 1);
    }

    #[test]
    fn failed_create_without_table_is_a_persistence_error() {
        let mut db = RacingCreate::new(false);
        let changelog = changelog();

        let result = changelog.ensure_table_exists(&mut db);
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(db.probes, 2);
        assert!(!db.conn.probe_table(changelog.table()).unwrap());
    }

    #[test]
    fn missing_table_reads_as_empty() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = changelog();
        assert!(changelog.list_applied(&mut conn).unwrap().is_empty());
        assert_eq!(
            changelog.latest_identifier(&mut conn).unwrap(),
            MigrationId::NONE
        );
    }

    #[test]
    fn record_and_remove() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = changelog();
        changelog.ensure_table_exists(&mut conn).unwrap();

        changelog
            .record_applied(
                &mut conn,
                MigrationId::new(300),
                "300-c.sql",
                "CREATE TABLE c (id INT)",
                "DROP TABLE c",
            )
            .unwrap();
        changelog
            .record_applied(&mut conn, MigrationId::new(100), "100-a.sql", "", "")
            .unwrap();

        let applied = changelog.list_applied(&mut conn).unwrap();
        assert_eq!(
            applied.iter().map(|r| r.identifier.value()).collect::<Vec<_>>(),
            vec![100, 300]
        );
        assert!(applied.iter().all(|r| r.is_applied() && r.applied_at.is_some()));
        assert_eq!(applied[0].forward_query, None);
        assert_eq!(applied[1].reverse_query.as_deref(), Some("DROP TABLE c"));
        assert_eq!(
            changelog.latest_identifier(&mut conn).unwrap(),
            MigrationId::new(300)
        );

        let change_id = applied[1].change_id.unwrap();
        changelog.remove_applied(&mut conn, change_id).unwrap();
        assert_eq!(
            changelog.latest_identifier(&mut conn).unwrap(),
            MigrationId::new(100)
        );

        // the row is gone, so a second delete means the in-memory view is stale
        assert!(matches!(
            changelog.remove_applied(&mut conn, change_id),
            Err(Error::Persistence(_))
        ));
    }

    #[test]
    fn duplicate_identifier_is_a_persistence_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = changelog();
        changelog.ensure_table_exists(&mut conn).unwrap();
        changelog
            .record_applied(&mut conn, MigrationId::new(1), "1-a.sql", "", "")
            .unwrap();
        let result = changelog.record_applied(&mut conn, MigrationId::new(1), "1-a.sql", "", "");
        assert!(matches!(result, Err(Error::Persistence(_))));
    }

    #[test]
    fn parses_created_at() {
        let at = parse_created_at("2024-01-02 03:04:05").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert!(parse_created_at("yesterday").is_err());
    }
}
