use std::str::FromStr;

use crate::{
    batcher::BatchLimits,
    config_db::ConfigDb,
    error::{Error, Result},
};

pub const KEY_BATCH_MAX_DOCS: &str = "batch.max_docs";
pub const KEY_BATCH_MAX_MB: &str = "batch.max_mb";
pub const KEY_SCROLL_PAGE_SIZE: &str = "scroll.page_size";
pub const KEY_POOL_THREADS: &str = "pool.threads";
pub const KEY_WRITER_MEMORY_MB: &str = "writer.memory_mb";

/// Every setting key understood by [`SyncConfig::load`].
pub const KNOWN_KEYS: &[&str] = &[
    KEY_BATCH_MAX_DOCS,
    KEY_BATCH_MAX_MB,
    KEY_SCROLL_PAGE_SIZE,
    KEY_POOL_THREADS,
    KEY_WRITER_MEMORY_MB,
];

/// Runtime tuning for synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub batch: BatchLimits,
    /// Page size for folder-expansion scrolls.
    pub scroll_page_size: usize,
    /// Worker pool size for per-resource cycles and rebuilds.
    pub pool_threads: usize,
    /// Index writer memory budget in bytes.
    pub writer_memory: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch: BatchLimits::new(1000, 10),
            scroll_page_size: 500,
            pool_threads: 4,
            writer_memory: 50 << 20,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by whatever is stored in the settings table.
    pub fn load(config_db: &ConfigDb) -> Result<Self> {
        let defaults = Self::default();
        let max_docs =
            setting(config_db, KEY_BATCH_MAX_DOCS, defaults.batch.max_docs)?;
        let max_mb = setting(
            config_db,
            KEY_BATCH_MAX_MB,
            defaults.batch.max_bytes >> 20,
        )?;
        let scroll_page_size =
            setting(config_db, KEY_SCROLL_PAGE_SIZE, defaults.scroll_page_size)?;
        let pool_threads =
            setting(config_db, KEY_POOL_THREADS, defaults.pool_threads)?;
        let writer_mb: usize = setting(
            config_db,
            KEY_WRITER_MEMORY_MB,
            defaults.writer_memory >> 20,
        )?;

        Ok(Self {
            batch: BatchLimits::new(max_docs.max(1), max_mb.max(1)),
            scroll_page_size: scroll_page_size.max(1),
            pool_threads: pool_threads.max(1),
            writer_memory: writer_mb.max(15) << 20,
        })
    }
}

/// Validate a key/value pair before it is written to the settings table.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(Error::Config(format!("unknown setting: {key}")));
    }
    parse::<usize>(key, value).map(|_| ())
}

fn setting<T: FromStr>(
    config_db: &ConfigDb,
    key: &str,
    default: T,
) -> Result<T> {
    match config_db.get_setting(key)? {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Config(format!("invalid value for {key}: {raw:?}"))
    })
}
