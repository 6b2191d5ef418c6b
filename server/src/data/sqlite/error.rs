//! SQLite error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Constraint violation (duplicate entry, invariant breach)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stored value that no longer parses (should be unreachable given the
    /// schema CHECK constraints)
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl SqliteError {
    /// Whether the error is likely to clear on retry (connection-level,
    /// not a constraint or query bug)
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::Io(_) => true,
            Self::MigrationFailed { .. } | Self::Conflict(_) | Self::Corrupt(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_not_transient() {
        assert!(!SqliteError::Conflict("duplicate".into()).is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(SqliteError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_migration_failure_display() {
        let err = SqliteError::MigrationFailed {
            version: 2,
            name: "add_column".to_string(),
            error: "syntax error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration 2 (add_column) failed: syntax error"
        );
    }
}
