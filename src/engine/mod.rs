//! Search-engine capabilities consumed by the batcher, the build
//! coordinator and the reconciliation engine.
//!
//! Each capability is a narrow trait so that callers only depend on what
//! they use. [`TantivyEngine`] implements all of them in-process.

mod embedded;

use serde_json::{Map, Value};

pub use self::embedded::{TantivyEngine, TextHit};
use crate::{
    error::Result,
    model::{ItemOutcome, WriteOp},
};

/// Writes a bulk request against one index or alias.
pub trait DocumentSender: Send + Sync {
    /// Returns one outcome per op, in order. An `Err` means the whole
    /// request failed and no item can be assumed written.
    fn send_bulk(&self, index: &str, ops: &[WriteOp])
    -> Result<Vec<ItemOutcome>>;
}

/// Which documents a lookup selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFilter {
    Exact(String),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    /// Index or alias name.
    pub index: String,
    pub filter: PathFilter,
    pub page_size: usize,
}

impl IndexQuery {
    pub fn exact(index: &str, path: &str) -> Self {
        Self {
            index: index.to_string(),
            filter: PathFilter::Exact(path.to_string()),
            page_size: 10,
        }
    }

    pub fn prefix(index: &str, prefix: &str, page_size: usize) -> Self {
        Self {
            index: index.to_string(),
            filter: PathFilter::Prefix(prefix.to_string()),
            page_size: page_size.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScrollId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub doc_id: String,
    pub source: Map<String, Value>,
}

impl SearchHit {
    pub fn path(&self) -> Option<&str> {
        self.source.get("path").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// Continuation handle; `None` once the result set is exhausted.
    pub scroll: Option<ScrollId>,
}

/// Paged document lookup.
pub trait SearchLookup: Send + Sync {
    fn search(&self, query: &IndexQuery) -> Result<SearchPage>;

    /// Next page for a scroll. An empty page ends the scroll.
    fn scroll_next(&self, scroll: ScrollId) -> Result<SearchPage>;

    fn clear_scroll(&self, scroll: ScrollId);
}

/// Opaque index mapping, stored alongside the index it created.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexMapping(pub Value);

/// Concrete index lifecycle and alias bindings.
pub trait AliasControl: Send + Sync {
    fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()>;

    fn index_for_alias(&self, alias: &str) -> Result<Option<String>>;

    /// Atomically bind `alias` to `index`, replacing any previous binding.
    fn point_alias(&self, index: &str, alias: &str) -> Result<()>;

    fn delete_index(&self, name: &str) -> Result<()>;

    fn index_exists(&self, name: &str) -> Result<bool>;
}

/// Everything the sync engine needs from a search backend.
pub trait SearchBackend: Send + Sync {
    fn sender(&self) -> &dyn DocumentSender;
    fn lookup(&self) -> &dyn SearchLookup;
    fn aliases(&self) -> &dyn AliasControl;
}

impl<T> SearchBackend for T
where
    T: DocumentSender + SearchLookup + AliasControl,
{
    fn sender(&self) -> &dyn DocumentSender {
        self
    }

    fn lookup(&self) -> &dyn SearchLookup {
        self
    }

    fn aliases(&self) -> &dyn AliasControl {
        self
    }
}
