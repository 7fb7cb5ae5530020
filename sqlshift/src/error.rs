/// Error type for the sqlshift crate.
///
/// Expected "nothing to do" conditions (already at the target, unknown or duplicate snapshot labels)
/// are never reported through this type: they surface as an [Outcome](crate::Outcome) on the report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A bad path, label or configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Reading or writing a migration script or the snapshot file failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// The changelog table could not be read or written, or no longer matches what was expected.
    #[error("changelog error: {0}")]
    Persistence(String),
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because io::Error and postgres::Error don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Configuration(a), Self::Configuration(b)) => a == b,
            (
                Self::Io {
                    context: a,
                    source: sa,
                },
                Self::Io {
                    context: b,
                    source: sb,
                },
            ) => a == b && sa.kind() == sb.kind(),
            (Self::Persistence(a), Self::Persistence(b)) => a == b,
            #[cfg(feature = "sqlite")]
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            #[cfg(feature = "mysql")]
            (Self::Mysql(a), Self::Mysql(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}
