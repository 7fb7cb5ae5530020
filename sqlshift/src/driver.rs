use crate::changelog::{Changelog, Database};
use crate::core::{Direction, Hooks, MigrationFailure, MigrationId, MigrationRecord};
use crate::error::Error;
use crate::repository::ScriptRepository;
use crate::script::Script;
use std::io::ErrorKind;
use std::time::Instant;

/// What a run got through before stopping.
#[derive(Debug, PartialEq)]
pub(crate) struct DriverOutcome {
    pub executed: Vec<MigrationId>,
    pub failure: Option<MigrationFailure>,
}

/// Executes an ordered selection of migrations and keeps the changelog in step.
///
/// On backends with transactional DDL each migration and its changelog row share one transaction.
/// Earlier migrations of the same run stay committed when a later one fails.
pub(crate) struct ExecutionDriver<'a> {
    pub repository: &'a ScriptRepository,
    pub changelog: &'a Changelog,
    pub hooks: &'a Hooks,
}

struct Queries {
    forward: String,
    reverse: String,
}

impl ExecutionDriver<'_> {
    /// Run `selection` in the given order, stopping at the first failing query.
    ///
    /// A script that cannot be loaded or whose query fails is reported in [DriverOutcome::failure].
    /// Errors writing the changelog are returned as `Err`.
    pub fn run(
        &self,
        db: &mut dyn Database,
        selection: &[MigrationRecord],
        direction: Direction,
    ) -> Result<DriverOutcome, Error> {
        let transactional = db.dialect().transactional_ddl();
        let mut executed = Vec::with_capacity(selection.len());

        for record in selection {
            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "migration",
                identifier = %record.identifier,
                script = %record.script_reference,
                direction = %direction
            )
            .entered();

            #[cfg(feature = "tracing")]
            tracing::info!("Starting migration");

            self.hooks
                .started(record.identifier, &record.script_reference, direction);
            let started_at = Instant::now();

            let queries = match self.resolve(record, direction) {
                Ok(queries) => queries,
                Err(error) => return Ok(self.halt(executed, record, error)),
            };
            let query = match direction {
                Direction::Apply => queries.forward.as_str(),
                Direction::Revert => queries.reverse.as_str(),
            };

            if transactional {
                db.begin_transaction()?;
            }

            if query.trim().is_empty() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Empty query, only updating the changelog");
            } else if let Err(error) = db.execute_query(query) {
                if transactional {
                    self.abort(db);
                }
                return Ok(self.halt(executed, record, error));
            }

            let bookkeeping = match direction {
                Direction::Apply => self.changelog.record_applied(
                    db,
                    record.identifier,
                    &record.script_reference,
                    &queries.forward,
                    &queries.reverse,
                ),
                Direction::Revert => match record.change_id {
                    Some(change_id) => self.changelog.remove_applied(db, change_id),
                    None => Err(Error::Persistence(format!(
                        "Migration {} is not recorded in the changelog",
                        record.identifier
                    ))),
                },
            };
            if let Err(error) = bookkeeping {
                if transactional {
                    self.abort(db);
                }
                return Err(error);
            }

            if transactional {
                db.commit_transaction()?;
            }

            let duration = started_at.elapsed();
            #[cfg(feature = "tracing")]
            tracing::info!(
                duration_ms = duration.as_millis(),
                "Migration completed successfully"
            );
            self.hooks.completed(
                record.identifier,
                &record.script_reference,
                direction,
                duration,
            );
            executed.push(record.identifier);
        }

        Ok(DriverOutcome {
            executed,
            failure: None,
        })
    }

    /// The queries for a record. A revert whose script file is gone falls back to what the changelog
    /// captured at apply time.
    fn resolve(&self, record: &MigrationRecord, direction: Direction) -> Result<Queries, Error> {
        match self.repository.load(&record.script_reference)? {
            Some(script) => Ok(Queries {
                forward: script.apply(),
                reverse: script.revert(),
            }),
            None if direction == Direction::Revert => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Script file is missing, reverting with the stored query");
                Ok(Queries {
                    forward: record.forward_query.clone().unwrap_or_default(),
                    reverse: record.reverse_query.clone().unwrap_or_default(),
                })
            }
            None => Err(Error::io(
                format!(
                    "Cannot read script {}",
                    self.repository.path_of(&record.script_reference).display()
                ),
                std::io::Error::new(ErrorKind::NotFound, "script file is missing"),
            )),
        }
    }

    fn halt(
        &self,
        executed: Vec<MigrationId>,
        record: &MigrationRecord,
        error: Error,
    ) -> DriverOutcome {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %error, "Migration failed");

        self.hooks
            .failed(record.identifier, &record.script_reference, &error);
        DriverOutcome {
            executed,
            failure: Some(MigrationFailure {
                identifier: record.identifier,
                script_reference: record.script_reference.clone(),
                error,
            }),
        }
    }

    fn abort(&self, db: &mut dyn Database) {
        if let Err(_error) = db.rollback_transaction() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_error, "Failed to roll back migration transaction");
        }
    }
}
