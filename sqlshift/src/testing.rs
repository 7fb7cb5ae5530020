//! Testing utilities for migration development

#[cfg(feature = "sqlite")]
pub mod sqlite;
