use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix marking a path as a folder wildcard (`/a/*`).
pub const FOLDER_WILDCARD: &str = "*";

/// One file as seen by a storage provider.
///
/// Paths are resource-relative, `/`-separated and start with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    /// Last modification time as seconds since the Unix epoch.
    pub last_modified: u64,
    /// Present on versioned backends only.
    pub version: Option<String>,
    pub is_delete_marker: bool,
    pub tags: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, size_bytes: u64, mtime: u64) -> Self {
        let path = path.into();
        let name = file_name(&path).to_string();
        Self {
            path,
            name,
            size_bytes,
            last_modified: mtime,
            version: None,
            is_delete_marker: false,
            tags: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

/// Last `/`-separated component of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Deleted,
    MovedFrom,
    MovedTo,
    FolderMoved,
    Reindex,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Deleted => "DELETED",
            Self::MovedFrom => "MOVED_FROM",
            Self::MovedTo => "MOVED_TO",
            Self::FolderMoved => "FOLDER_MOVED",
            Self::Reindex => "REINDEX",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CREATED" => Ok(Self::Created),
            "DELETED" => Ok(Self::Deleted),
            "MOVED_FROM" => Ok(Self::MovedFrom),
            "MOVED_TO" => Ok(Self::MovedTo),
            "FOLDER_MOVED" => Ok(Self::FolderMoved),
            "REINDEX" => Ok(Self::Reindex),
            other => {
                Err(crate::Error::Config(format!("unknown event type: {other}")))
            }
        }
    }
}

/// One raw change notification written by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Producer clock; only meaningful for ordering.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub resource_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_to: Option<String>,
}

impl ChangeEvent {
    pub fn new(
        timestamp: i64,
        event_type: EventType,
        resource_id: &str,
        path: &str,
    ) -> Self {
        Self {
            timestamp,
            event_type,
            resource_id: resource_id.to_string(),
            path: path.to_string(),
            path_to: None,
        }
    }

    pub fn folder_moved(
        timestamp: i64,
        resource_id: &str,
        from: &str,
        to: &str,
    ) -> Self {
        Self {
            path_to: Some(to.to_string()),
            ..Self::new(timestamp, EventType::FolderMoved, resource_id, from)
        }
    }

    /// The folder prefix when `path` is a folder wildcard.
    pub fn folder_prefix(&self) -> Option<&str> {
        folder_prefix(&self.path)
    }
}

/// `/a/*` -> `Some("/a/")`; anything else -> `None`.
pub fn folder_prefix(path: &str) -> Option<&str> {
    path.strip_suffix(FOLDER_WILDCARD)
        .filter(|prefix| prefix.is_empty() || prefix.ends_with('/'))
}

/// A pending mutation against a concrete index or alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Index {
        index: String,
        doc_id: String,
        source: Map<String, Value>,
    },
    Delete {
        index: String,
        doc_id: String,
    },
}

impl WriteOp {
    pub fn index(
        index: &str,
        doc_id: impl Into<String>,
        source: Map<String, Value>,
    ) -> Self {
        Self::Index {
            index: index.to_string(),
            doc_id: doc_id.into(),
            source,
        }
    }

    pub fn delete(index: &str, doc_id: impl Into<String>) -> Self {
        Self::Delete {
            index: index.to_string(),
            doc_id: doc_id.into(),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Index { index, .. } | Self::Delete { index, .. } => index,
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            Self::Index { doc_id, .. } | Self::Delete { doc_id, .. } => doc_id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    /// Serialized payload size. Deletes carry no payload and count as zero.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Index { doc_id, source, .. } => {
                doc_id.len()
                    + serde_json::to_vec(source).map_or(0, |v| v.len())
            }
            Self::Delete { .. } => 0,
        }
    }
}

/// Per-item result of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub doc_id: String,
    pub failed: bool,
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn ok(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            failed: false,
            message: None,
        }
    }

    pub fn failed(doc_id: &str, message: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            failed: true,
            message: Some(message.into()),
        }
    }
}

/// Names one batch of source events, the unit of retirement.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SourceRef {
    pub resource_id: String,
    pub producer: String,
    pub batch: String,
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_id, self.producer, self.batch)
    }
}

/// A registered file-backed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    /// Provider key, e.g. `nfs` or `memory`.
    pub backend: String,
    /// Bucket name or export directory.
    pub root: String,
    pub alias: String,
    /// Tag handed to the post-flush hook.
    pub object_type: String,
}

impl Resource {
    pub fn new(id: &str, backend: &str, root: &str) -> Self {
        Self {
            id: id.to_string(),
            backend: backend.to_string(),
            root: root.to_string(),
            alias: default_alias(id),
            object_type: backend.to_string(),
        }
    }
}

pub fn default_alias(resource_id: &str) -> String {
    format!("docsync-{}", resource_id.to_ascii_lowercase())
}
