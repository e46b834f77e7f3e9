use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("lock acquisition interrupted")]
    LockInterrupted,

    #[error("lock upgrade is not allowed while shared owners exist")]
    IllegalUpgrade,

    #[error("deadlock detected while waiting for a lock")]
    Deadlock,

    #[error("database is closed")]
    DatabaseClosed,

    #[error("index is closed")]
    IndexClosed,

    #[error("database is full")]
    DatabaseFull,

    #[error("node cache is exhausted; no evictable node found")]
    CacheExhausted,

    #[error("corrupt page store: {0}")]
    CorruptPageStore(String),

    #[error("invalid argument: {0}")]
    IllegalArgument(String),

    #[error("invalid state: {0}")]
    IllegalState(String),
}

impl DbError {
    /// Fatal errors transition the database into a broken, read-only mode.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::CorruptPageStore(_))
    }

    /// Transient lock errors leave the transaction usable.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            DbError::LockTimeout | DbError::LockInterrupted | DbError::Deadlock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DbError::CorruptPageStore("bad magic".into()).is_fatal());
        assert!(!DbError::LockTimeout.is_fatal());
        assert!(DbError::Deadlock.is_lock_failure());
    }
}
