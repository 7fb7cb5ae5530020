use crate::core::{MigrationId, MigrationRecord};
use crate::error::Error;
use crate::script::SqlScript;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// The script extension used when none is configured.
pub const DEFAULT_EXTENSION: &str = "sql";

/// A file in the migrations directory that was not treated as a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedScript {
    pub file_name: String,
    pub reason: String,
}

/// Result of scanning the migrations directory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scan {
    /// Pending records, strictly ascending by identifier.
    pub migrations: Vec<MigrationRecord>,
    /// Files with the script extension whose name did not start with a valid identifier.
    pub skipped: Vec<SkippedScript>,
}

/// Read-only view over a directory of migration scripts.
///
/// Nothing is cached: every call to [ScriptRepository::list_on_disk] rescans the directory.
#[derive(Debug, Clone)]
pub struct ScriptRepository {
    directory: PathBuf,
    extension: String,
}

impl ScriptRepository {
    /// Open a migrations directory. Fails immediately if the path is missing or not a directory.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, Error> {
        let directory = directory.into();
        let metadata = fs::metadata(&directory).map_err(|e| {
            Error::io(
                format!("Cannot open migrations directory {}", directory.display()),
                e,
            )
        })?;
        if !metadata.is_dir() {
            return Err(Error::io(
                format!("Cannot open migrations directory {}", directory.display()),
                std::io::Error::new(ErrorKind::Other, "not a directory"),
            ));
        }
        Ok(Self {
            directory,
            extension: DEFAULT_EXTENSION.to_string(),
        })
    }

    /// Use a different script extension, with or without the leading dot.
    pub fn with_extension(mut self, extension: impl AsRef<str>) -> Self {
        self.extension = extension.as_ref().trim_start_matches('.').to_string();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Full path of a script reference inside the directory.
    pub fn path_of(&self, script_reference: &str) -> PathBuf {
        self.directory.join(script_reference)
    }

    /// Scan the directory for scripts.
    ///
    /// The identifier is the part of the file stem before the first `-`. When two files share an
    /// identifier, the one seen last in directory order wins; that order is platform-defined.
    pub fn list_on_disk(&self) -> Result<Scan, Error> {
        let entries = fs::read_dir(&self.directory).map_err(|e| {
            Error::io(
                format!("Cannot read migrations directory {}", self.directory.display()),
                e,
            )
        })?;

        let mut found: BTreeMap<MigrationId, String> = BTreeMap::new();
        let mut skipped = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::io(
                    format!("Cannot read migrations directory {}", self.directory.display()),
                    e,
                )
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension.as_str()) {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                skipped.push(SkippedScript {
                    file_name: path.to_string_lossy().into_owned(),
                    reason: "file name is not valid UTF-8".to_string(),
                });
                continue;
            };

            match parse_identifier(file_name) {
                Ok(identifier) => {
                    if let Some(previous) = found.insert(identifier, file_name.to_string()) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            identifier = %identifier,
                            kept = %file_name,
                            dropped = %previous,
                            "Duplicate migration identifier"
                        );
                        #[cfg(not(feature = "tracing"))]
                        let _ = previous;
                    }
                }
                Err(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(file = %file_name, reason = %reason, "Skipping script");
                    skipped.push(SkippedScript {
                        file_name: file_name.to_string(),
                        reason,
                    });
                }
            }
        }

        skipped.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        let migrations = found
            .into_iter()
            .map(|(identifier, file_name)| MigrationRecord::pending(identifier, file_name))
            .collect();

        Ok(Scan {
            migrations,
            skipped,
        })
    }

    /// Read and parse a script. Returns `Ok(None)` if the file no longer exists.
    pub fn load(&self, script_reference: &str) -> Result<Option<SqlScript>, Error> {
        if script_reference.contains('/') || script_reference.contains('\\') {
            return Err(Error::Configuration(format!(
                "Script reference '{}' must be a plain file name",
                script_reference
            )));
        }
        let path = self.path_of(script_reference);
        match fs::read_to_string(&path) {
            Ok(source) => Ok(Some(SqlScript::parse(&source))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("Cannot read script {}", path.display()), e)),
        }
    }
}

fn parse_identifier(file_name: &str) -> Result<MigrationId, String> {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);
    let token = stem.split('-').next().unwrap_or_default();
    let identifier: MigrationId = token
        .parse()
        .map_err(|_| format!("'{}' is not a valid migration identifier", token))?;
    if identifier.is_none() {
        return Err("identifier 0 is reserved".to_string());
    }
    Ok(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let result = ScriptRepository::open(dir.path().join("nope"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn open_fails_for_a_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "file.sql", "");
        let result = ScriptRepository::open(dir.path().join("file.sql"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn lists_scripts_sorted_by_identifier() {
        let dir = TempDir::new().unwrap();
        write(&dir, "300-third.sql", "");
        write(&dir, "100-first.sql", "");
        write(&dir, "200-second-part-two.sql", "");
        write(&dir, "150.sql", "");
        write(&dir, "README.md", "");
        fs::create_dir(dir.path().join("400-directory.sql")).unwrap();

        let repository = ScriptRepository::open(dir.path()).unwrap();
        let scan = repository.list_on_disk().unwrap();
        let identifiers: Vec<u64> = scan
            .migrations
            .iter()
            .map(|m| m.identifier.value())
            .collect();
        assert_eq!(identifiers, vec![100, 150, 200, 300]);
        assert_eq!(scan.migrations[2].script_reference, "200-second-part-two.sql");
        assert!(scan.migrations.iter().all(|m| !m.is_applied()));
        assert!(scan.skipped.is_empty());
    }

    #[test]
    fn invalid_names_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        write(&dir, "100-ok.sql", "");
        write(&dir, "abc-bad.sql", "");
        write(&dir, "0-reserved.sql", "");

        let scan = ScriptRepository::open(dir.path())
            .unwrap()
            .list_on_disk()
            .unwrap();
        assert_eq!(scan.migrations.len(), 1);
        let skipped: Vec<&str> = scan.skipped.iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(skipped, vec!["0-reserved.sql", "abc-bad.sql"]);
    }

    #[test]
    fn duplicate_identifiers_are_collapsed() {
        let dir = TempDir::new().unwrap();
        write(&dir, "100-a.sql", "");
        write(&dir, "100-b.sql", "");

        let scan = ScriptRepository::open(dir.path())
            .unwrap()
            .list_on_disk()
            .unwrap();
        assert_eq!(scan.migrations.len(), 1);
        assert_eq!(scan.migrations[0].identifier, MigrationId::new(100));
    }

    #[test]
    fn custom_extension() {
        let dir = TempDir::new().unwrap();
        write(&dir, "100-a.sql", "");
        write(&dir, "200-b.pgsql", "");

        let repository = ScriptRepository::open(dir.path())
            .unwrap()
            .with_extension(".pgsql");
        assert_eq!(repository.extension(), "pgsql");
        let scan = repository.list_on_disk().unwrap();
        assert_eq!(scan.migrations.len(), 1);
        assert_eq!(scan.migrations[0].identifier, MigrationId::new(200));
    }

    #[test]
    fn load_reads_and_parses_script() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "100-a.sql",
            "-- sqlshift:apply\nCREATE TABLE a (id INT);\n-- sqlshift:revert\nDROP TABLE a;\n",
        );
        let repository = ScriptRepository::open(dir.path()).unwrap();

        let script = repository.load("100-a.sql").unwrap().unwrap();
        assert_eq!(script.apply(), "CREATE TABLE a (id INT);");
        assert_eq!(script.revert(), "DROP TABLE a;");

        assert_eq!(repository.load("999-missing.sql").unwrap(), None);
        assert!(matches!(
            repository.load("../100-a.sql"),
            Err(Error::Configuration(_))
        ));
    }
}
