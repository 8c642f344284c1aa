use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::{Map, Value};
use tantivy::{
    DocAddress,
    Index,
    IndexReader,
    IndexWriter,
    Searcher,
    TantivyDocument,
    Term,
    collector::{Count, DocSetCollector, TopDocs},
    doc,
    query::{AllQuery, Query, QueryParser, RegexQuery, TermQuery},
    schema::{
        FAST,
        Field,
        IndexRecordOption,
        STORED,
        STRING,
        Schema,
        TextFieldIndexing,
        TextOptions,
        Value as _,
    },
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};
use tracing::{debug, info, warn};

use super::{
    AliasControl,
    DocumentSender,
    IndexMapping,
    IndexQuery,
    PathFilter,
    ScrollId,
    SearchHit,
    SearchLookup,
    SearchPage,
};
use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
    model::{ItemOutcome, WriteOp},
};

/// Field names used in the schema.
pub mod fields {
    pub const DOC_ID: &str = "doc_id";
    pub const PATH: &str = "path";
    pub const NAME: &str = "name";
    pub const MTIME: &str = "mtime";
    pub const SOURCE: &str = "source";
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
struct SchemaFields {
    doc_id: Field,
    path: Field,
    name: Field,
    mtime: Field,
    source: Field,
}

impl SchemaFields {
    fn resolve(schema: &Schema) -> Result<Self> {
        Ok(Self {
            doc_id: schema.get_field(fields::DOC_ID)?,
            path: schema.get_field(fields::PATH)?,
            name: schema.get_field(fields::NAME)?,
            mtime: schema.get_field(fields::MTIME)?,
            source: schema.get_field(fields::SOURCE)?,
        })
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::DOC_ID, STRING | STORED);
    builder.add_text_field(fields::PATH, STRING | STORED);

    let name_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::NAME, name_opts);

    builder.add_u64_field(fields::MTIME, STORED | FAST);
    builder.add_text_field(fields::SOURCE, STORED);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One physical index with its reader and single writer.
struct ConcreteIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: SchemaFields,
}

impl ConcreteIndex {
    fn new(index: Index, writer_memory: usize) -> Result<Self> {
        register_tokenizers(&index);
        let fields = SchemaFields::resolve(&index.schema())?;
        let reader = index.reader()?;
        let writer = index.writer_with_num_threads(1, writer_memory)?;
        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    /// Replace-by-id write. The source must carry a string `path`.
    fn upsert(
        &self,
        writer: &IndexWriter,
        doc_id: &str,
        source: &Map<String, Value>,
    ) -> Result<()> {
        if doc_id.is_empty() {
            return Err(Error::Search("empty document id".into()));
        }
        let path = source
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Search("source has no string path".into()))?;
        let name = source.get("name").and_then(Value::as_str).unwrap_or("");
        let mtime = source
            .get("last_modified")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let f = self.fields;
        let document = doc!(
            f.doc_id => doc_id,
            f.path => path,
            f.name => name,
            f.mtime => mtime,
            f.source => serde_json::to_string(source)?,
        );

        writer.delete_term(Term::from_field_text(f.doc_id, doc_id));
        writer.add_document(document)?;
        Ok(())
    }

    fn delete(&self, writer: &IndexWriter, doc_id: &str) {
        writer.delete_term(Term::from_field_text(self.fields.doc_id, doc_id));
    }

    fn searcher(&self) -> Result<Searcher> {
        self.reader.reload()?;
        Ok(self.reader.searcher())
    }

    fn hit(&self, searcher: &Searcher, address: DocAddress) -> Result<SearchHit> {
        let doc: TantivyDocument = searcher.doc(address)?;
        let doc_id = extract_text(&doc, self.fields.doc_id);
        let source = match serde_json::from_str::<Value>(&extract_text(
            &doc,
            self.fields.source,
        )) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert(
                    "path".into(),
                    Value::from(extract_text(&doc, self.fields.path)),
                );
                map
            }
        };
        Ok(SearchHit { doc_id, source })
    }
}

/// Snapshot of a lookup result, paged out on demand.
struct Scroll {
    index: Arc<ConcreteIndex>,
    searcher: Searcher,
    remaining: std::vec::IntoIter<DocAddress>,
    page_size: usize,
}

impl Scroll {
    fn next_page(&mut self) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::with_capacity(self.page_size);
        for address in self.remaining.by_ref().take(self.page_size) {
            hits.push(self.index.hit(&self.searcher, address)?);
        }
        Ok(hits)
    }

    fn exhausted(&self) -> bool {
        self.remaining.len() == 0
    }
}

/// A full-text match from [`TantivyEngine::search_text`].
#[derive(Debug, Clone)]
pub struct TextHit {
    pub score: f32,
    pub doc_id: String,
    pub path: String,
    pub name: String,
    pub mtime: u64,
}

/// Embedded search engine: one tantivy index per concrete index name,
/// aliases and mappings kept in the config database.
pub struct TantivyEngine {
    /// `None` keeps every index in RAM.
    dir: Option<PathBuf>,
    config_db: Arc<ConfigDb>,
    writer_memory: usize,
    open: Mutex<HashMap<String, Arc<ConcreteIndex>>>,
    scrolls: Mutex<HashMap<u64, Scroll>>,
    next_scroll: AtomicU64,
}

impl TantivyEngine {
    /// Engine rooted at `dir`, one subdirectory per concrete index.
    pub fn open(
        dir: &Path,
        config_db: Arc<ConfigDb>,
        writer_memory: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self::with_dir(Some(dir.to_path_buf()), config_db, writer_memory))
    }

    /// In-memory engine (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_dir(
            None,
            Arc::new(ConfigDb::open_in_memory()?),
            15_000_000,
        ))
    }

    fn with_dir(
        dir: Option<PathBuf>,
        config_db: Arc<ConfigDb>,
        writer_memory: usize,
    ) -> Self {
        Self {
            dir,
            config_db,
            writer_memory,
            open: Mutex::new(HashMap::new()),
            scrolls: Mutex::new(HashMap::new()),
            next_scroll: AtomicU64::new(1),
        }
    }

    fn index_dir(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(name))
    }

    fn on_disk(&self, name: &str) -> bool {
        self.index_dir(name)
            .is_some_and(|path| path.join("meta.json").is_file())
    }

    fn load(&self, name: &str) -> Result<Arc<ConcreteIndex>> {
        let mut open = lock(&self.open);
        if let Some(index) = open.get(name) {
            return Ok(Arc::clone(index));
        }
        match self.index_dir(name) {
            Some(path) if path.join("meta.json").is_file() => {
                let index = Arc::new(ConcreteIndex::new(
                    Index::open_in_dir(&path)?,
                    self.writer_memory,
                )?);
                open.insert(name.to_string(), Arc::clone(&index));
                Ok(index)
            }
            _ => Err(Error::not_found("index", name)),
        }
    }

    /// Resolve an alias or concrete name to a loaded index.
    ///
    /// An alias can be repointed and its old index deleted between the
    /// alias lookup and the load; one retry picks up the new binding.
    fn resolve(&self, name: &str) -> Result<Arc<ConcreteIndex>> {
        let mut retried = false;
        loop {
            let target = self
                .config_db
                .get_alias(name)?
                .unwrap_or_else(|| name.to_string());
            match self.load(&target) {
                Err(Error::NotFound { .. }) if !retried && target != name => {
                    retried = true;
                }
                other => return other,
            }
        }
    }

    /// Number of live documents behind an alias or concrete index.
    pub fn count(&self, name: &str) -> Result<usize> {
        let index = self.resolve(name)?;
        Ok(index.searcher()?.search(&AllQuery, &Count)?)
    }

    /// Full-text search over file names, ranked by BM25.
    pub fn search_text(
        &self,
        name: &str,
        query_str: &str,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let index = self.resolve(name)?;
        let f = index.fields;
        let searcher = index.searcher()?;

        let parser = QueryParser::for_index(&index.index, vec![f.name]);
        let (query, _errors) = parser.parse_query_lenient(query_str);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            results.push(TextHit {
                score,
                doc_id: extract_text(&doc, f.doc_id),
                path: extract_text(&doc, f.path),
                name: extract_text(&doc, f.name),
                mtime: extract_u64(&doc, f.mtime),
            });
        }
        Ok(results)
    }

    /// Every concrete index known to the engine, sorted by name.
    pub fn list_indices(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = lock(&self.open).keys().cloned().collect();
        if let Some(dir) = &self.dir {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if self.on_disk(&name) && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn config_db(&self) -> &ConfigDb {
        &self.config_db
    }

    fn register_scroll(&self, scroll: Scroll) -> ScrollId {
        let id = self.next_scroll.fetch_add(1, Ordering::Relaxed);
        lock(&self.scrolls).insert(id, scroll);
        ScrollId(id)
    }
}

impl DocumentSender for TantivyEngine {
    fn send_bulk(
        &self,
        index: &str,
        ops: &[WriteOp],
    ) -> Result<Vec<ItemOutcome>> {
        let target = self.resolve(index)?;
        let mut writer = lock(&target.writer);

        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                WriteOp::Index { doc_id, source, .. } => {
                    target.upsert(&writer, doc_id, source)
                }
                WriteOp::Delete { doc_id, .. } => {
                    target.delete(&writer, doc_id);
                    Ok(())
                }
            };
            outcomes.push(match result {
                Ok(()) => ItemOutcome::ok(op.doc_id()),
                Err(e) => ItemOutcome::failed(op.doc_id(), e.to_string()),
            });
        }

        if let Err(e) = writer.commit() {
            warn!(index, error = %e, "bulk commit failed, rolling back");
            if let Err(rollback) = writer.rollback() {
                warn!(index, error = %rollback, "rollback failed");
            }
            return Ok(ops
                .iter()
                .map(|op| {
                    ItemOutcome::failed(op.doc_id(), format!("commit: {e}"))
                })
                .collect());
        }
        drop(writer);
        target.reader.reload()?;

        debug!(index, items = ops.len(), "bulk committed");
        Ok(outcomes)
    }
}

impl SearchLookup for TantivyEngine {
    fn search(&self, query: &IndexQuery) -> Result<SearchPage> {
        let index = self.resolve(&query.index)?;
        let f = index.fields;
        let searcher = index.searcher()?;

        let lookup: Box<dyn Query> = match &query.filter {
            PathFilter::Exact(path) => Box::new(TermQuery::new(
                Term::from_field_text(f.path, path),
                IndexRecordOption::Basic,
            )),
            PathFilter::Prefix(prefix) => Box::new(RegexQuery::from_pattern(
                &format!("{}.*", escape_regex(prefix)),
                f.path,
            )?),
        };

        let mut addresses: Vec<DocAddress> =
            searcher.search(&*lookup, &DocSetCollector)?.into_iter().collect();
        addresses.sort();

        let mut scroll = Scroll {
            index,
            searcher,
            remaining: addresses.into_iter(),
            page_size: query.page_size.max(1),
        };
        let hits = scroll.next_page()?;
        let scroll = (!scroll.exhausted()).then(|| self.register_scroll(scroll));

        Ok(SearchPage { hits, scroll })
    }

    fn scroll_next(&self, scroll: ScrollId) -> Result<SearchPage> {
        let mut scrolls = lock(&self.scrolls);
        let Some(context) = scrolls.get_mut(&scroll.0) else {
            return Ok(SearchPage::default());
        };
        let hits = context.next_page()?;
        let next = if context.exhausted() {
            scrolls.remove(&scroll.0);
            None
        } else {
            Some(scroll)
        };
        Ok(SearchPage { hits, scroll: next })
    }

    fn clear_scroll(&self, scroll: ScrollId) {
        lock(&self.scrolls).remove(&scroll.0);
    }
}

impl AliasControl for TantivyEngine {
    fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        validate_name(name)?;
        if self.index_exists(name)? {
            return Err(Error::Config(format!("index '{name}' already exists")));
        }
        if self.config_db.get_alias(name)?.is_some() {
            return Err(Error::Config(format!("'{name}' is already an alias")));
        }

        let index = match self.index_dir(name) {
            Some(path) => {
                std::fs::create_dir_all(&path)?;
                Index::create_in_dir(&path, build_schema())?
            }
            None => Index::create_in_ram(build_schema()),
        };
        let index = Arc::new(ConcreteIndex::new(index, self.writer_memory)?);
        lock(&self.open).insert(name.to_string(), index);
        self.config_db.set_mapping(name, &mapping.0.to_string())?;

        info!(index = name, "created index");
        Ok(())
    }

    fn index_for_alias(&self, alias: &str) -> Result<Option<String>> {
        self.config_db.get_alias(alias)
    }

    fn point_alias(&self, index: &str, alias: &str) -> Result<()> {
        validate_name(alias)?;
        if !self.index_exists(index)? {
            return Err(Error::not_found("index", index));
        }
        if self.index_exists(alias)? {
            return Err(Error::Config(format!(
                "alias '{alias}' clashes with an index name"
            )));
        }
        self.config_db.set_alias(alias, index)?;
        info!(alias, index, "alias repointed");
        Ok(())
    }

    fn delete_index(&self, name: &str) -> Result<()> {
        let was_open = lock(&self.open).remove(name).is_some();
        let dir = self.index_dir(name).filter(|path| path.is_dir());
        if !was_open && dir.is_none() {
            return Err(Error::not_found("index", name));
        }
        if let Some(path) = dir {
            std::fs::remove_dir_all(path)?;
        }
        for alias in self.config_db.remove_aliases_for(name)? {
            warn!(alias, index = name, "alias dropped with its index");
        }
        self.config_db.remove_mapping(name)?;

        info!(index = name, "deleted index");
        Ok(())
    }

    fn index_exists(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.open).contains_key(name) || self.on_disk(name))
    }
}

impl std::fmt::Debug for TantivyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyEngine")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Index and alias names double as directory names.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid index or alias name: {name:?}")))
    }
}

fn escape_regex(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}
