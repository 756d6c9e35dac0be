//! Store configuration.
//!
//! # Validation Rules
//!
//! - `page_size` must be a power of two in `512..=65536`
//! - `segment_size` must be a multiple of `page_size` holding at least two pages
//! - `max_children_per_node` must be at least 4 and fit a page (header, arrays, leaf log)
//! - `log_percentage` must be in `1..=75` when log-buffered leaves are enabled
//! - `queue_capacity` must be non-zero
//! - `VersionRetention::Last(n)` requires `n >= 1`

use std::path::PathBuf;

use crate::{
    buffer::Endian,
    btree::codec::{LOG_ENTRY_SIZE, NODE_HEADER_SIZE},
    checksum::ChecksumType,
    error::{Error, Result},
};

/// Default page size (4 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default segment file size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Smallest accepted fan-out.
pub const MIN_CHILDREN_PER_NODE: usize = 4;

const DEFAULT_LOG_PERCENTAGE: u8 = 25;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_CACHE_CAPACITY: usize = 1024;
const DEFAULT_RETAINED_VERSIONS: usize = 1024;

/// How many historical root versions stay reachable in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRetention {
    /// Keep every version for the lifetime of the tree.
    All,
    /// Keep at least the newest `n` versions, including the current one. Older versions
    /// are released in batches, so up to `2 * n` may be reachable at a time.
    Last(usize),
}

impl Default for VersionRetention {
    fn default() -> Self {
        VersionRetention::Last(DEFAULT_RETAINED_VERSIONS)
    }
}

/// Configuration for a tree, a store, or one of their storages.
///
/// # Example
///
/// ```
/// use arbor_store::{ChecksumType, StoreConfig};
///
/// let config = StoreConfig::builder()
///     .root_dir("/tmp/arbor")
///     .page_size(8192)
///     .checksum(ChecksumType::Xxh3)
///     .log_buffered_leaves(true)
///     .build()
///     .expect("valid store config");
/// assert_eq!(config.page_size, 8192);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the storage files. Required for file-backed stores.
    pub root_dir: Option<PathBuf>,
    /// Byte order of every integer written to disk.
    pub endian: Endian,
    /// Page size in bytes.
    pub page_size: usize,
    /// Size of each segment file in bytes.
    pub segment_size: u64,
    /// Checksum algorithm for headers, pages and value records.
    pub checksum: ChecksumType,
    /// Key count above which a node splits.
    pub max_children_per_node: usize,
    /// Reserve part of each leaf page for an unsorted append log.
    pub log_buffered_leaves: bool,
    /// Share of the page reserved for the leaf log, in percent.
    pub log_percentage: u8,
    /// Route index mutations through the background writer.
    pub async_index_write: bool,
    /// Bounded queue capacity of the background writer.
    pub queue_capacity: usize,
    /// fsync storages on every commit.
    pub sync_on_commit: bool,
    /// How many root versions stay readable.
    pub version_retention: VersionRetention,
    /// Decoded-node cache capacity in nodes. Zero disables the cache.
    pub cache_capacity: usize,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a validated configuration.
    ///
    /// When `max_children_per_node` is omitted it is derived from the page capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any rule in the module docs is violated.
    #[builder]
    pub fn new(
        #[builder(into)] root_dir: Option<PathBuf>,
        #[builder(default)] endian: Endian,
        #[builder(default = DEFAULT_PAGE_SIZE)] page_size: usize,
        #[builder(default = DEFAULT_SEGMENT_SIZE)] segment_size: u64,
        #[builder(default)] checksum: ChecksumType,
        max_children_per_node: Option<usize>,
        #[builder(default = false)] log_buffered_leaves: bool,
        #[builder(default = DEFAULT_LOG_PERCENTAGE)] log_percentage: u8,
        #[builder(default = false)] async_index_write: bool,
        #[builder(default = DEFAULT_QUEUE_CAPACITY)] queue_capacity: usize,
        #[builder(default = true)] sync_on_commit: bool,
        #[builder(default)] version_retention: VersionRetention,
        #[builder(default = DEFAULT_CACHE_CAPACITY)] cache_capacity: usize,
    ) -> Result<Self> {
        let log_size = page_log_size(page_size, log_buffered_leaves, log_percentage);
        let max_children_per_node =
            max_children_per_node.unwrap_or_else(|| derived_max_children(page_size, log_size));
        let config = Self {
            root_dir,
            endian,
            page_size,
            segment_size,
            checksum,
            max_children_per_node,
            log_buffered_leaves,
            log_percentage,
            async_index_write,
            queue_capacity,
            sync_on_commit,
            version_retention,
            cache_capacity,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(invalid(format!(
                "page_size must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        let page = self.page_size as u64;
        if self.segment_size % page != 0 || self.segment_size < 2 * page {
            return Err(invalid(format!(
                "segment_size must be a multiple of page_size ({page}) holding at least two pages, got {}",
                self.segment_size
            )));
        }
        if self.log_buffered_leaves && !(1..=75).contains(&self.log_percentage) {
            return Err(invalid(format!(
                "log_percentage must be in 1..=75, got {}",
                self.log_percentage
            )));
        }
        if self.log_buffered_leaves && self.log_capacity() == 0 {
            return Err(invalid("leaf log region holds no entries at this page size".to_string()));
        }
        if self.max_children_per_node < MIN_CHILDREN_PER_NODE {
            return Err(invalid(format!(
                "max_children_per_node must be at least {MIN_CHILDREN_PER_NODE}, got {}",
                self.max_children_per_node
            )));
        }
        let limit = derived_max_children(self.page_size, self.page_log_size());
        if self.max_children_per_node > limit {
            return Err(invalid(format!(
                "max_children_per_node {} does not fit a {}-byte page (limit {limit})",
                self.max_children_per_node, self.page_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be non-zero".to_string()));
        }
        if self.version_retention == VersionRetention::Last(0) {
            return Err(invalid("version_retention must keep at least one version".to_string()));
        }
        Ok(())
    }

    /// Bytes reserved at the end of each leaf page for the append log.
    pub fn page_log_size(&self) -> usize {
        page_log_size(self.page_size, self.log_buffered_leaves, self.log_percentage)
    }

    /// Number of log entries a leaf page holds.
    pub fn log_capacity(&self) -> usize {
        self.page_log_size() / LOG_ENTRY_SIZE
    }

    /// Minimum key count of a non-root node before it borrows or merges.
    pub fn min_children_per_node(&self) -> usize {
        self.max_children_per_node / 2
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            endian: Endian::default(),
            page_size: DEFAULT_PAGE_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            checksum: ChecksumType::default(),
            max_children_per_node: derived_max_children(DEFAULT_PAGE_SIZE, 0),
            log_buffered_leaves: false,
            log_percentage: DEFAULT_LOG_PERCENTAGE,
            async_index_write: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sync_on_commit: true,
            version_retention: VersionRetention::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidConfig { reason }
}

fn page_log_size(page_size: usize, enabled: bool, percentage: u8) -> usize {
    if !enabled {
        return 0;
    }
    let raw = page_size * usize::from(percentage) / 100;
    raw - raw % LOG_ENTRY_SIZE
}

/// Largest key count such that both a leaf (keys + values + log) and an internal node
/// (keys + one extra child) fit the page.
fn derived_max_children(page_size: usize, log_size: usize) -> usize {
    let leaf = page_size.saturating_sub(NODE_HEADER_SIZE + log_size) / 16;
    let internal = page_size.saturating_sub(NODE_HEADER_SIZE + 8) / 16;
    leaf.min(internal)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.max_children_per_node, (4096 - 72) / 16);
        assert_eq!(config.page_log_size(), 0);
        assert_eq!(config, StoreConfig::builder().build().unwrap());
    }

    #[test]
    fn test_builder_overrides() {
        let config = StoreConfig::builder()
            .root_dir("/tmp/arbor-test")
            .endian(Endian::Big)
            .page_size(1024)
            .segment_size(8 * 1024)
            .checksum(ChecksumType::Sha256)
            .max_children_per_node(10)
            .sync_on_commit(false)
            .version_retention(VersionRetention::All)
            .build()
            .unwrap();
        assert_eq!(config.root_dir, Some(PathBuf::from("/tmp/arbor-test")));
        assert_eq!(config.endian, Endian::Big);
        assert_eq!(config.max_children_per_node, 10);
        assert_eq!(config.min_children_per_node(), 5);
        assert!(!config.sync_on_commit);
    }

    #[test]
    fn test_log_region_shrinks_fanout() {
        let config = StoreConfig::builder().log_buffered_leaves(true).build().unwrap();
        // 25% of 4096 = 1024, rounded down to whole 17-byte entries.
        assert_eq!(config.page_log_size(), 1020);
        assert_eq!(config.log_capacity(), 60);
        assert_eq!(config.max_children_per_node, (4096 - 64 - 1020) / 16);
    }

    #[test]
    fn test_rejects_bad_page_size() {
        for page_size in [0, 256, 1000, 131_072] {
            let err = StoreConfig::builder().page_size(page_size).build().unwrap_err();
            assert!(matches!(err, Error::InvalidConfig { .. }), "{page_size}");
        }
    }

    #[test]
    fn test_rejects_bad_segment_size() {
        assert!(StoreConfig::builder().segment_size(4096).build().is_err());
        assert!(StoreConfig::builder().segment_size(4096 * 2 + 1).build().is_err());
        assert!(StoreConfig::builder().segment_size(4096 * 2).build().is_ok());
    }

    #[test]
    fn test_rejects_bad_fanout() {
        assert!(StoreConfig::builder().max_children_per_node(3).build().is_err());
        assert!(StoreConfig::builder().max_children_per_node(10_000).build().is_err());
        assert!(StoreConfig::builder().max_children_per_node(4).build().is_ok());
    }

    #[test]
    fn test_rejects_bad_log_percentage() {
        let err = StoreConfig::builder()
            .log_buffered_leaves(true)
            .log_percentage(90)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("log_percentage"));
        // Ignored when the log is disabled.
        assert!(StoreConfig::builder().log_percentage(90).build().is_ok());
    }

    #[test]
    fn test_rejects_zero_retention_and_queue() {
        assert!(
            StoreConfig::builder().version_retention(VersionRetention::Last(0)).build().is_err()
        );
        assert!(StoreConfig::builder().queue_capacity(0).build().is_err());
    }
}
