//! Migration code units.
//!
//! A migration script is a plain SQL file split into two sections by marker lines:
//!
//! ```text
//! -- sqlshift:apply
//! CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//!
//! -- sqlshift:revert
//! DROP TABLE IF EXISTS users;
//! ```
//!
//! Anything before the first marker is a free-form header. A section that is missing or blank means the
//! migration has no SQL side effect in that direction; it is still recorded in (or removed from) the
//! changelog.

/// Marker line that opens the apply section of a script.
pub const APPLY_MARKER: &str = "-- sqlshift:apply";

/// Marker line that opens the revert section of a script.
pub const REVERT_MARKER: &str = "-- sqlshift:revert";

/// The two operations every migration provides.
///
/// Both return the query to execute, possibly empty. Scripts loaded from disk are [SqlScript]s, but the
/// trait can be implemented by statically linked migrations as well.
pub trait Script {
    /// The query that moves the schema forward.
    fn apply(&self) -> String;

    /// The query that undoes [Script::apply].
    fn revert(&self) -> String;
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Header,
    Apply,
    Revert,
}

/// A migration read from a SQL file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlScript {
    apply: String,
    revert: String,
}

impl SqlScript {
    pub fn new(apply: impl Into<String>, revert: impl Into<String>) -> Self {
        Self {
            apply: apply.into(),
            revert: revert.into(),
        }
    }

    /// Split a script's source into its apply and revert sections.
    ///
    /// Markers are matched case-insensitively on their own line. When a marker appears more than once,
    /// the sections are concatenated in file order.
    pub fn parse(source: &str) -> Self {
        let mut section = Section::Header;
        let mut apply = Vec::new();
        let mut revert = Vec::new();

        for line in source.lines() {
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case(APPLY_MARKER) {
                section = Section::Apply;
                continue;
            }
            if trimmed.eq_ignore_ascii_case(REVERT_MARKER) {
                section = Section::Revert;
                continue;
            }
            match section {
                Section::Header => {}
                Section::Apply => apply.push(line),
                Section::Revert => revert.push(line),
            }
        }

        Self {
            apply: apply.join("\n").trim().to_string(),
            revert: revert.join("\n").trim().to_string(),
        }
    }

    /// Render the script back into its on-disk form, with `header` lines written as SQL comments.
    pub fn render(&self, header: &[String]) -> String {
        let mut out = String::new();
        for line in header {
            out.push_str("-- ");
            out.push_str(line);
            out.push('\n');
        }
        if !header.is_empty() {
            out.push('\n');
        }
        out.push_str(APPLY_MARKER);
        out.push('\n');
        if !self.apply.is_empty() {
            out.push_str(&self.apply);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(REVERT_MARKER);
        out.push('\n');
        if !self.revert.is_empty() {
            out.push_str(&self.revert);
            out.push('\n');
        }
        out
    }
}

impl Script for SqlScript {
    fn apply(&self) -> String {
        self.apply.clone()
    }

    fn revert(&self) -> String {
        self.revert.clone()
    }
}
