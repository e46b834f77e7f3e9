// Database configuration and durability modes.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DbError, Result};

/// Smallest page able to hold a two-entry internal node with maximum-length
/// separator keys for that size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Page offsets are encoded in 16 bits.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Durability guarantee applied when a transaction commits.
///
/// Stronger modes cost more per commit; weaker modes defer durability to the
/// operating system or to the next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Redo is fsynced before commit returns.
    Sync,
    /// Redo is flushed to the OS buffer, but not synced.
    NoSync,
    /// Redo is buffered in-process; flushed by checkpoints.
    NoFlush,
    /// No redo at all; durability only at the next checkpoint.
    NoLog,
    /// No redo and no durability. Reserved for internal bogus transactions
    /// and recovery replay; rejected by [`Config::validate`].
    NoRedo,
}

impl DurabilityMode {
    pub(crate) fn logs_redo(self) -> bool {
        matches!(
            self,
            DurabilityMode::Sync | DurabilityMode::NoSync | DurabilityMode::NoFlush
        )
    }
}

/// Database configuration.
///
/// Construct with [`Config::new`], adjust with the builder-style setters, and
/// pass to [`crate::Database::open`]. Validation happens at open time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base path of the database. Two files are derived from it: the pages
    /// file (the path itself) and `<path>.lock`. `None` selects a bounded
    /// in-memory page store.
    pub base_file: Option<PathBuf>,
    /// Page size in bytes. Must be even and within
    /// [`MIN_PAGE_SIZE`]..=[`MAX_PAGE_SIZE`].
    pub page_size: usize,
    /// Lower bound of the node cache, in bytes.
    pub min_cache_size: usize,
    /// Upper bound of the node cache, in bytes. At least three page frames.
    pub max_cache_size: usize,
    /// Interval of the background checkpointer; `None` means manual only.
    pub checkpoint_rate: Option<Duration>,
    /// Default durability mode for transactions.
    pub durability_mode: DurabilityMode,
    /// Hold page frames in page-aligned allocations.
    pub direct_page_access: bool,
    /// Default lock timeout per acquisition; `None` means wait forever.
    pub lock_timeout: Option<Duration>,
    /// Capacity of the in-memory page store, in pages. Only used when
    /// `base_file` is `None`.
    pub max_memory_pages: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_file: None,
            page_size: 4096,
            min_cache_size: 3 * 4096,
            max_cache_size: 1000 * 4096,
            checkpoint_rate: Some(Duration::from_secs(1)),
            durability_mode: DurabilityMode::Sync,
            direct_page_access: false,
            lock_timeout: Some(Duration::from_secs(1)),
            max_memory_pages: 1 << 20,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_file = Some(path.into());
        self
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn min_cache_size(mut self, bytes: usize) -> Self {
        self.min_cache_size = bytes;
        self
    }

    pub fn max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn checkpoint_rate(mut self, rate: Option<Duration>) -> Self {
        self.checkpoint_rate = rate;
        self
    }

    pub fn durability_mode(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    pub fn direct_page_access(mut self, direct: bool) -> Self {
        self.direct_page_access = direct;
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.page_size % 2 != 0 {
            return Err(DbError::IllegalArgument(format!(
                "page size must be even: {}",
                self.page_size
            )));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(DbError::IllegalArgument(format!(
                "page size out of range: {}",
                self.page_size
            )));
        }
        if self.max_cache_size < 3 * self.page_size {
            return Err(DbError::IllegalArgument(
                "cache must hold at least 3 page frames".into(),
            ));
        }
        if self.min_cache_size > self.max_cache_size {
            return Err(DbError::IllegalArgument(
                "min cache size exceeds max cache size".into(),
            ));
        }
        if self.durability_mode == DurabilityMode::NoRedo {
            return Err(DbError::IllegalArgument(
                "NoRedo is not a configurable durability mode".into(),
            ));
        }
        Ok(())
    }

    /// Number of node frames the cache may hold.
    pub(crate) fn cache_frames(&self) -> usize {
        (self.max_cache_size / self.page_size).max(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_odd_page_size_rejected() {
        let config = Config::new().page_size(4095);
        assert!(matches!(
            config.validate(),
            Err(DbError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_tiny_cache_rejected() {
        let config = Config::new().page_size(4096).max_cache_size(2 * 4096);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_redo_rejected() {
        let config = Config::new().durability_mode(DurabilityMode::NoRedo);
        assert!(config.validate().is_err());
    }
}
