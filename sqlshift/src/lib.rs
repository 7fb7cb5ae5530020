#![cfg_attr(docsrs, feature(doc_cfg))]
//! `sqlshift` is a schema migration runner for directories of plain SQL scripts.
//!
//! Core concepts:
//! - A migration is a file named `<identifier>-<label>.sql` with an apply section and a revert section.
//!   Identifiers are numbers; scripts created with [Migrator::create] use the UTC creation time
//!   (`YYYYMMDDHHMMSS`).
//! - Applied migrations are recorded in a changelog table, together with the apply and revert queries
//!   that were current when they ran. A rollback can therefore undo a migration whose file was deleted.
//! - Snapshots give a name to a set of migrations so that releases can be targeted by label.
//!
//! # Updating and rolling back
//!
//! ```ignore
//! use rusqlite::Connection;
//! use sqlshift::{MigrationId, Migrator, Target};
//!
//! let migrator = Migrator::open("migrations")?;
//! let mut conn = Connection::open("app.db")?;
//!
//! // apply everything up to now
//! let report = migrator.update(&mut conn, Target::Latest)?;
//! assert!(report.success());
//!
//! // undo everything after 20240101000000, newest first
//! migrator.rollback(&mut conn, Target::Identifier(MigrationId::new(20240101000000)))?;
//! ```
//!
//! Expected conditions (already at the requested version, unknown snapshot, a target on the wrong side
//! of the latest applied migration) are reported through [MigrationReport::outcome] rather than as
//! errors. [MigrationReport::success] is `false` for all of them.
//!
//! # Partial failure
//!
//! A run stops at the first failing script. Migrations before it stay applied and recorded, so running
//! the same command again resumes at the failed script. On SQLite and PostgreSQL the failing script's
//! own statements are rolled back; MySQL commits DDL implicitly and may leave part of it behind.
//!
//! # Concurrency
//!
//! Creating the changelog table tolerates a concurrent creator, but two processes updating the same
//! database at the same time are not coordinated. Take an advisory lock around the call if that can
//! happen.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default).
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! Tracing integration is available with the `tracing` feature flag, and testing utilities with the
//! `testing` feature flag.

mod core;
pub use core::{
    Clock, Direction, MigrationFailure, MigrationId, MigrationRecord, MigrationReport, Outcome,
    SystemClock, Target, DEFAULT_CHANGELOG_TABLE_NAME,
};

mod error;
pub use error::Error;

pub mod changelog;
pub use changelog::{Changelog, Database, Dialect};

mod driver;

mod engine;
pub use engine::{Migrator, Plan, Status};

pub mod generator;

pub mod repository;
pub use repository::{Scan, ScriptRepository, SkippedScript};

pub mod script;
pub use script::{Script, SqlScript};

pub mod snapshot;
pub use snapshot::{Snapshot, SnapshotIndex, SnapshotOutcome};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(all(test, feature = "mysql"))]
pub(crate) mod test_mysql;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
