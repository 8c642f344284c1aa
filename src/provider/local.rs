use std::{
    collections::{BTreeMap, VecDeque},
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    time::SystemTime,
};

use globset::{Glob, GlobSet, GlobSetBuilder};

use super::{Page, PageSource, Paged, StorageProvider, check_relative};
use crate::{
    error::{Error, Result},
    model::FileRecord,
};

const BACKEND: &str = "nfs";
const PAGE_SIZE: usize = 1000;

/// Files of a network export mounted on the local filesystem.
///
/// The resource root is the mount directory. Hidden files and directories
/// are skipped, as are paths matching any exclude glob. Exports carry no
/// versions, so every record is the latest one.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    excludes: Option<GlobSet>,
    page_size: usize,
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self {
            excludes: None,
            page_size: PAGE_SIZE,
        }
    }
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip resource-relative paths matching any of `patterns`.
    pub fn with_excludes(patterns: &[&str]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Config(format!("invalid exclude pattern: {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| Error::Config(format!("invalid exclude set: {e}")))?;
        Ok(Self {
            excludes: Some(set),
            ..Self::default()
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn resolve(root: &str, path: &str) -> Result<PathBuf> {
        check_relative(BACKEND, path)?;
        Ok(Path::new(root).join(path.trim_start_matches('/')))
    }
}

fn is_excluded(excludes: Option<&GlobSet>, path: &str) -> bool {
    excludes.is_some_and(|set| set.is_match(path.trim_start_matches('/')))
}

/// `Ok(None)` when the entry disappeared underneath us.
fn unless_vanished<T>(result: io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
}

struct Entry {
    rel: String,
    path: PathBuf,
    kind: Kind,
}

/// Depth-first walk of an export, one page at a time.
///
/// A directory is read only when the walk reaches it. Entries are sorted
/// per directory with directories keyed as `name/`, which yields records
/// in path order overall.
struct DirWalk {
    root: PathBuf,
    prefix: String,
    excludes: Option<GlobSet>,
    page_size: usize,
    stack: Vec<VecDeque<Entry>>,
}

impl DirWalk {
    fn new(
        root: PathBuf,
        prefix: &str,
        excludes: Option<GlobSet>,
        page_size: usize,
    ) -> Self {
        Self {
            root,
            prefix: prefix.to_string(),
            excludes,
            page_size,
            stack: Vec::new(),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.stack.clear();
        // Start from the deepest directory the prefix names.
        let start_rel = match self.prefix.rfind('/') {
            Some(idx) => &self.prefix[..idx],
            None => "",
        };
        let start = self.root.join(start_rel.trim_start_matches('/'));
        if start.is_dir() {
            let entries = self.read_dir(&start)?.unwrap_or_default();
            self.stack.push(entries);
        }
        Ok(())
    }

    fn read_dir(&self, dir: &Path) -> Result<Option<VecDeque<Entry>>> {
        let Some(read) = unless_vanished(std::fs::read_dir(dir))? else {
            return Ok(None);
        };
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip hidden files and directories.
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let rel = relative_path(&self.root, &path);
            if is_excluded(self.excludes.as_ref(), &rel) {
                continue;
            }
            let Some(file_type) = unless_vanished(entry.file_type())? else {
                continue;
            };
            let kind = if file_type.is_dir() {
                Kind::Dir
            } else if file_type.is_symlink() {
                Kind::Symlink
            } else if file_type.is_file() {
                Kind::File
            } else {
                continue;
            };
            entries.push(Entry { rel, path, kind });
        }
        entries.sort_by_cached_key(|e| match e.kind {
            Kind::Dir => format!("{}/", e.rel),
            _ => e.rel.clone(),
        });
        Ok(Some(entries.into()))
    }

    /// The record for `entry`, descending into directories as needed.
    fn visit(&mut self, entry: Entry) -> Result<Option<FileRecord>> {
        match entry.kind {
            Kind::Dir => {
                // Only descend where the prefix can still match.
                let dir_rel = format!("{}/", entry.rel);
                if dir_rel.starts_with(&self.prefix)
                    || self.prefix.starts_with(&dir_rel)
                {
                    if let Some(entries) = self.read_dir(&entry.path)? {
                        self.stack.push(entries);
                    }
                }
                Ok(None)
            }
            _ if !entry.rel.starts_with(&self.prefix) => Ok(None),
            Kind::Symlink => {
                let Ok(resolved) = entry.path.canonicalize() else {
                    return Ok(None); // broken symlink
                };
                if !resolved.is_file() {
                    return Ok(None);
                }
                unless_vanished(make_record(entry.rel, &resolved))
            }
            Kind::File => unless_vanished(make_record(entry.rel, &entry.path)),
        }
    }
}

impl PageSource<FileRecord> for DirWalk {
    fn fetch(&mut self, token: Option<&str>) -> Result<Page<FileRecord>> {
        if token.is_none() {
            self.reset()?;
        }
        let mut items = Vec::new();
        while items.len() < self.page_size {
            let Some(entries) = self.stack.last_mut() else {
                break;
            };
            let Some(entry) = entries.pop_front() else {
                self.stack.pop();
                continue;
            };
            if let Some(record) = self.visit(entry)? {
                items.push(record);
            }
        }
        let next = (!self.stack.is_empty()).then(|| items.len().to_string());
        Ok(Page { items, next })
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("/{}", parts.join("/"))
}

fn make_record(rel: String, absolute: &Path) -> io::Result<FileRecord> {
    let metadata = std::fs::metadata(absolute)?;
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut record = FileRecord::new(rel, metadata.len(), mtime);
    record.labels = BTreeMap::from([("latest".to_string(), "true".to_string())]);
    Ok(record)
}

impl StorageProvider for LocalProvider {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn list(&self, root: &str, prefix: &str) -> Result<Paged<FileRecord>> {
        check_relative(BACKEND, prefix)?;
        let root = Path::new(root).canonicalize().map_err(|e| {
            Error::provider(BACKEND, format!("{root}: {e}"))
        })?;
        Ok(Paged::new(DirWalk::new(
            root,
            prefix,
            self.excludes.clone(),
            self.page_size,
        )))
    }

    fn list_versions(
        &self,
        root: &str,
        prefix: &str,
        _include_deleted: bool,
    ) -> Result<Paged<FileRecord>> {
        self.list(root, prefix)
    }

    fn read_content(
        &self,
        root: &str,
        path: &str,
    ) -> Result<Box<dyn Read + Send>> {
        let file = File::open(Self::resolve(root, path)?)?;
        Ok(Box::new(file))
    }

    fn delete(&self, root: &str, path: &str) -> Result<()> {
        std::fs::remove_file(Self::resolve(root, path)?)?;
        Ok(())
    }

    fn stat(&self, root: &str, path: &str) -> Result<Option<FileRecord>> {
        let absolute = Self::resolve(root, path)?;
        let hidden = path.split('/').any(|part| part.starts_with('.'));
        if hidden || is_excluded(self.excludes.as_ref(), path) || !absolute.is_file()
        {
            return Ok(None);
        }
        unless_vanished(make_record(path.to_string(), &absolute))
    }
}
