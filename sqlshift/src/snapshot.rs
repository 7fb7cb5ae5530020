//! Named checkpoints over the migration history.
//!
//! Snapshots live in a line-delimited JSON file next to the scripts, one object per line:
//!
//! ```text
//! {"format":1,"label":"v1","created_at":"20240105120000","migrations":{"100":"100-a.sql","200":"200-b.sql"}}
//! ```
//!
//! Every append rewrites the whole file through a temporary file in the same directory followed by a
//! rename, so readers see either the old or the new collection.

use crate::core::MigrationId;
use crate::error::Error;
use crate::generator::sanitize_label;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// File name of the snapshot index inside the migrations directory.
pub const DEFAULT_SNAPSHOT_FILE_NAME: &str = "snapshots.jsonl";

const FORMAT_VERSION: u32 = 1;

/// Every migration that was new when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub label: String,
    pub created_at: MigrationId,
    pub migrations: BTreeMap<MigrationId, String>,
}

impl Snapshot {
    /// The oldest captured migration, the target of a rollback to this snapshot.
    pub fn first(&self) -> Option<MigrationId> {
        self.migrations.keys().next().copied()
    }

    /// The newest captured migration, the target of an update to this snapshot.
    pub fn last(&self) -> Option<MigrationId> {
        self.migrations.keys().next_back().copied()
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotLine {
    format: u32,
    label: String,
    created_at: MigrationId,
    migrations: BTreeMap<MigrationId, String>,
}

impl From<SnapshotLine> for Snapshot {
    fn from(line: SnapshotLine) -> Self {
        Self {
            label: line.label,
            created_at: line.created_at,
            migrations: line.migrations,
        }
    }
}

impl From<&Snapshot> for SnapshotLine {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            format: FORMAT_VERSION,
            label: snapshot.label.clone(),
            created_at: snapshot.created_at,
            migrations: snapshot.migrations.clone(),
        }
    }
}

/// Result of [SnapshotIndex::append].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Created(Snapshot),
    /// Every on-disk migration already belongs to a snapshot. Nothing was written.
    NothingToCapture,
    /// A snapshot with this label already exists. Nothing was written.
    Duplicate(String),
}

impl SnapshotOutcome {
    /// `false` only for a duplicate label; having nothing to capture is not a failure.
    pub fn success(&self) -> bool {
        !matches!(self, SnapshotOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotIndex {
    path: PathBuf,
}

impl SnapshotIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All snapshots in creation order. A missing file is an empty index.
    pub fn list(&self) -> Result<Vec<Snapshot>, Error> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(Error::io(
                    format!("Cannot read snapshot file {}", self.path.display()),
                    e,
                ))
            }
        };

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                let parsed: SnapshotLine = serde_json::from_str(line).map_err(|e| {
                    self.corrupt(number + 1, e.to_string())
                })?;
                if parsed.format != FORMAT_VERSION {
                    return Err(self.corrupt(
                        number + 1,
                        format!("unsupported format version {}", parsed.format),
                    ));
                }
                Ok(Snapshot::from(parsed))
            })
            .collect()
    }

    fn corrupt(&self, line: usize, reason: String) -> Error {
        Error::io(
            format!("Corrupt snapshot file {} at line {}", self.path.display(), line),
            std::io::Error::new(ErrorKind::InvalidData, reason),
        )
    }

    pub fn find(&self, label: &str) -> Result<Option<Snapshot>, Error> {
        let label = sanitize_label(label);
        Ok(self.list()?.into_iter().find(|s| s.label == label))
    }

    /// Capture every on-disk migration not already part of an earlier snapshot.
    pub fn append(
        &self,
        label: &str,
        on_disk: &BTreeMap<MigrationId, String>,
        created_at: MigrationId,
    ) -> Result<SnapshotOutcome, Error> {
        let label = sanitize_label(label);
        if label.is_empty() {
            return Err(Error::Configuration(
                "Snapshot label must contain at least one letter or digit".to_string(),
            ));
        }

        let mut snapshots = self.list()?;
        if snapshots.iter().any(|s| s.label == label) {
            return Ok(SnapshotOutcome::Duplicate(label));
        }

        let captured: BTreeSet<MigrationId> = snapshots
            .iter()
            .flat_map(|s| s.migrations.keys().copied())
            .collect();
        let migrations: BTreeMap<MigrationId, String> = on_disk
            .iter()
            .filter(|(identifier, _)| !captured.contains(identifier))
            .map(|(identifier, reference)| (*identifier, reference.clone()))
            .collect();
        if migrations.is_empty() {
            return Ok(SnapshotOutcome::NothingToCapture);
        }

        let snapshot = Snapshot {
            label,
            created_at,
            migrations,
        };
        snapshots.push(snapshot.clone());
        self.write_all(&snapshots)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            label = %snapshot.label,
            migrations = snapshot.migrations.len(),
            "Snapshot created"
        );

        Ok(SnapshotOutcome::Created(snapshot))
    }

    fn write_all(&self, snapshots: &[Snapshot]) -> Result<(), Error> {
        let context = || format!("Cannot write snapshot file {}", self.path.display());
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temp = NamedTempFile::new_in(directory).map_err(|e| Error::io(context(), e))?;
        for snapshot in snapshots {
            let line = serde_json::to_string(&SnapshotLine::from(snapshot)).map_err(|e| {
                Error::io(context(), std::io::Error::new(ErrorKind::InvalidData, e))
            })?;
            writeln!(temp, "{}", line).map_err(|e| Error::io(context(), e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| Error::io(context(), e))?;
        temp.persist(&self.path)
            .map_err(|e| Error::io(context(), e.error))?;
        Ok(())
    }
}
