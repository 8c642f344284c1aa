use std::{
    collections::{BTreeMap, HashMap},
    io::{Cursor, Read},
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::trace;

use super::{CredentialSupplier, Paged, StorageProvider, check_relative};
use crate::{
    error::{Error, Result},
    model::FileRecord,
};

const BACKEND: &str = "memory";
const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredVersion {
    version: String,
    content: Option<Vec<u8>>,
    modified: u64,
    tags: BTreeMap<String, String>,
}

impl StoredVersion {
    fn is_delete_marker(&self) -> bool {
        self.content.is_none()
    }
}

type Bucket = BTreeMap<String, Vec<StoredVersion>>;

/// In-memory versioned object store.
///
/// Deleting an object appends a delete marker; older versions stay
/// listable through [`StorageProvider::list_versions`]. Every operation
/// pulls a fresh credential from the supplier and fails on an expired one.
pub struct MemoryProvider {
    credentials: CredentialSupplier,
    buckets: RwLock<HashMap<String, Bucket>>,
    next_version: AtomicU64,
    page_size: usize,
}

impl MemoryProvider {
    pub fn new(credentials: CredentialSupplier) -> Self {
        Self {
            credentials,
            buckets: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn authorize(&self) -> Result<()> {
        let credential = (self.credentials)()?;
        if credential.is_expired() {
            return Err(Error::Credential("credential expired".into()));
        }
        trace!(backend = BACKEND, "credential accepted");
        Ok(())
    }

    fn read_buckets(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Bucket>> {
        self.buckets.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_buckets(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Bucket>> {
        self.buckets.write().unwrap_or_else(|p| p.into_inner())
    }

    fn new_version(&self) -> String {
        format!("v{}", self.next_version.fetch_add(1, Ordering::Relaxed))
    }

    /// Store a new version of `path` in bucket `root`.
    pub fn put(
        &self,
        root: &str,
        path: &str,
        content: impl Into<Vec<u8>>,
        tags: &[(&str, &str)],
    ) -> Result<String> {
        self.authorize()?;
        check_relative(BACKEND, path)?;
        let version = self.new_version();
        let stored = StoredVersion {
            version: version.clone(),
            content: Some(content.into()),
            modified: now_secs(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.write_buckets()
            .entry(root.to_string())
            .or_default()
            .entry(path.to_string())
            .or_default()
            .push(stored);
        Ok(version)
    }

    fn records(
        &self,
        root: &str,
        prefix: &str,
        all_versions: bool,
        include_deleted: bool,
    ) -> Result<Vec<FileRecord>> {
        self.authorize()?;
        check_relative(BACKEND, prefix)?;
        let buckets = self.read_buckets();
        let bucket = buckets
            .get(root)
            .ok_or_else(|| Error::provider(BACKEND, format!("no such bucket: {root}")))?;

        let mut records = Vec::new();
        for (path, versions) in bucket.range(prefix.to_string()..) {
            if !path.starts_with(prefix) {
                break;
            }
            let latest = versions.len().saturating_sub(1);
            for (i, stored) in versions.iter().enumerate() {
                let is_latest = i == latest;
                if !all_versions && !is_latest {
                    continue;
                }
                if stored.is_delete_marker() && !include_deleted {
                    continue;
                }
                records.push(to_record(path, stored, is_latest));
            }
        }
        Ok(records)
    }
}

fn to_record(path: &str, stored: &StoredVersion, is_latest: bool) -> FileRecord {
    let size = stored.content.as_ref().map_or(0, |c| c.len() as u64);
    let mut record = FileRecord::new(path, size, stored.modified);
    record.version = Some(stored.version.clone());
    record.is_delete_marker = stored.is_delete_marker();
    record.tags = stored.tags.clone();
    record.labels = BTreeMap::from([
        ("latest".to_string(), is_latest.to_string()),
        ("storage_class".to_string(), "STANDARD".to_string()),
    ]);
    record
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl StorageProvider for MemoryProvider {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn list(&self, root: &str, prefix: &str) -> Result<Paged<FileRecord>> {
        let records = self.records(root, prefix, false, false)?;
        Ok(Paged::from_vec(records, self.page_size))
    }

    fn list_versions(
        &self,
        root: &str,
        prefix: &str,
        include_deleted: bool,
    ) -> Result<Paged<FileRecord>> {
        let records = self.records(root, prefix, true, include_deleted)?;
        Ok(Paged::from_vec(records, self.page_size))
    }

    fn read_content(
        &self,
        root: &str,
        path: &str,
    ) -> Result<Box<dyn Read + Send>> {
        self.authorize()?;
        let buckets = self.read_buckets();
        let content = buckets
            .get(root)
            .and_then(|bucket| bucket.get(path))
            .and_then(|versions| versions.last())
            .and_then(|stored| stored.content.clone())
            .ok_or_else(|| Error::not_found("object", path))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn delete(&self, root: &str, path: &str) -> Result<()> {
        self.authorize()?;
        let version = self.new_version();
        let mut buckets = self.write_buckets();
        let versions = buckets
            .get_mut(root)
            .and_then(|bucket| bucket.get_mut(path))
            .filter(|versions| {
                versions.last().is_some_and(|v| !v.is_delete_marker())
            })
            .ok_or_else(|| Error::not_found("object", path))?;
        versions.push(StoredVersion {
            version,
            content: None,
            modified: now_secs(),
            tags: BTreeMap::new(),
        });
        Ok(())
    }

    fn stat(&self, root: &str, path: &str) -> Result<Option<FileRecord>> {
        self.authorize()?;
        let buckets = self.read_buckets();
        let Some(bucket) = buckets.get(root) else {
            return Err(Error::provider(BACKEND, format!("no such bucket: {root}")));
        };
        Ok(bucket
            .get(path)
            .and_then(|versions| versions.last())
            .filter(|stored| !stored.is_delete_marker())
            .map(|stored| to_record(path, stored, true)))
    }
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider").finish_non_exhaustive()
    }
}
