//! Scaffolding for new migration scripts.

use crate::core::{Clock, MigrationId};
use crate::error::Error;
use crate::repository::ScriptRepository;
use crate::script::SqlScript;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};

/// How many identifiers are tried before giving up on creating a script.
pub const SCRIPT_ATTEMPTS: usize = 10;

/// Reduce a label to ASCII letters, digits, `.` and single `-` separators. Case is kept.
pub fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}

/// The revert query pre-filled for a sanitized label, if its prefix names one.
///
/// `create-table-user-roles` yields `DROP TABLE IF EXISTS user_roles;`. The prefix is matched without
/// regard to case; the name keeps its case.
pub fn revert_template(label: &str) -> Option<String> {
    let (kind, name) = if let Some(name) = strip_prefix_ignore_case(label, "create-table-") {
        ("TABLE", name)
    } else if let Some(name) = strip_prefix_ignore_case(label, "create-database-") {
        ("DATABASE", name)
    } else {
        return None;
    };
    let name = name.replace(['-', '.'], "_");
    if name.is_empty() {
        return None;
    }
    Some(format!("DROP {} IF EXISTS {};", kind, name))
}

fn strip_prefix_ignore_case<'a>(label: &'a str, prefix: &str) -> Option<&'a str> {
    let head = label.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &label[prefix.len()..])
}

/// Write an empty script for `label` and return its file name.
///
/// The identifier comes from the clock. If it is already taken on disk, successive identifiers are tried.
/// Those are still ordered after the clock's value but need not be valid timestamps (`...000060`).
pub fn create_script(
    repository: &ScriptRepository,
    label: &str,
    clock: &dyn Clock,
) -> Result<String, Error> {
    let label = sanitize_label(label);
    if label.is_empty() {
        return Err(Error::Configuration(
            "Migration label must contain at least one letter or digit".to_string(),
        ));
    }

    let taken: BTreeSet<MigrationId> = repository
        .list_on_disk()?
        .migrations
        .into_iter()
        .map(|record| record.identifier)
        .collect();

    let template = SqlScript::new("", revert_template(&label).unwrap_or_default());
    let mut identifier = clock.now();

    for _ in 0..SCRIPT_ATTEMPTS {
        if taken.contains(&identifier) {
            identifier = identifier.successor();
            continue;
        }

        let file_name = format!("{}-{}.{}", identifier, label, repository.extension());
        let path = repository.path_of(&file_name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                identifier = identifier.successor();
                continue;
            }
            Err(e) => {
                return Err(Error::io(
                    format!("Cannot create script {}", path.display()),
                    e,
                ))
            }
        };

        let header = vec![
            format!("Migration {}", file_name),
            "The apply section runs on update, the revert section on rollback.".to_string(),
        ];
        file.write_all(template.render(&header).as_bytes())
            .map_err(|e| Error::io(format!("Cannot write script {}", path.display()), e))?;

        #[cfg(feature = "tracing")]
        tracing::info!(script = %file_name, "Created migration script");

        return Ok(file_name);
    }

    Err(Error::io(
        format!(
            "Cannot allocate an identifier for '{}' after {} attempts",
            label, SCRIPT_ATTEMPTS
        ),
        std::io::Error::new(ErrorKind::AlreadyExists, "identifier collision"),
    ))
}
