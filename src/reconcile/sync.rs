use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{
    expand::expand_events,
    merge::{Merged, merge_events},
};
use crate::{
    batcher::{BatchItem, Batcher, PostFlushHook},
    build::{BuildCoordinator, populate_from_provider},
    config::SyncConfig,
    config_db::ConfigDb,
    engine::{IndexMapping, IndexQuery, SearchBackend},
    error::{Error, Result},
    events::EventLog,
    mapper::{DefaultMapper, DocumentMapper},
    model::{ChangeEvent, Resource, SourceRef, WriteOp},
    provider::{ProviderRegistry, StorageProvider},
    rebuild::{
        ActiveRebuildSet,
        Claim,
        CompletionCallback,
        RebuildHandle,
        RebuildOutcome,
        RebuildScheduler,
        build_pool,
    },
};

/// What a cycle did about full rebuilds.
#[derive(Debug, Default)]
pub enum RebuildStatus {
    #[default]
    NotRequested,
    /// A rebuild was launched by this cycle.
    Started(RebuildHandle),
    /// A rebuild was wanted but one is already running.
    AlreadyRunning,
}

impl RebuildStatus {
    pub fn handle(self) -> Option<RebuildHandle> {
        match self {
            Self::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Outcome of one [`SyncEngine::synchronize`] cycle.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub resource_id: String,
    /// The resource was rebuilding and incremental work was skipped.
    pub skipped_rebuilding: bool,
    /// Another cycle held the resource; nothing was loaded.
    pub skipped_busy: bool,
    pub batches: usize,
    pub events: usize,
    /// Malformed lines dropped while loading.
    pub malformed: usize,
    pub upserts: usize,
    pub deletes: usize,
    /// Events with neither a live file nor an indexed document.
    pub stale: usize,
    pub failed_items: usize,
    /// Batches that errored and stay pending.
    pub failed_batches: usize,
    pub retired: usize,
    pub rebuild: RebuildStatus,
}

impl SyncReport {
    fn new(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            ..Self::default()
        }
    }
}

/// Collects the sources of clean flushes; retirement happens once the
/// whole cycle's outcome is known.
#[derive(Default)]
struct Acknowledged {
    sources: Mutex<BTreeSet<SourceRef>>,
}

impl PostFlushHook for Acknowledged {
    fn retire(&self, object_type: &str, sources: &[SourceRef]) -> Result<()> {
        debug!(object_type, batches = sources.len(), "flush acknowledged");
        self.sources
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(sources.iter().cloned());
        Ok(())
    }
}

/// Ops resolved for one event batch.
#[derive(Default)]
struct Resolved {
    items: Vec<BatchItem>,
    upserts: usize,
    deletes: usize,
    stale: usize,
}

/// Drives reconciliation cycles and rebuilds for registered resources.
pub struct SyncEngine {
    config_db: Arc<ConfigDb>,
    backend: Arc<dyn SearchBackend>,
    providers: ProviderRegistry,
    events: Arc<dyn EventLog>,
    mapper: Arc<dyn DocumentMapper>,
    mapping: IndexMapping,
    config: SyncConfig,
    pool: Arc<rayon::ThreadPool>,
    scheduler: RebuildScheduler,
}

impl SyncEngine {
    pub fn new(
        config_db: Arc<ConfigDb>,
        backend: Arc<dyn SearchBackend>,
        providers: ProviderRegistry,
        events: Arc<dyn EventLog>,
        config: SyncConfig,
    ) -> Result<Self> {
        let pool = build_pool(config.pool_threads)?;
        let scheduler =
            RebuildScheduler::new(Arc::clone(&pool), ActiveRebuildSet::new());
        Ok(Self {
            config_db,
            backend,
            providers,
            events,
            mapper: Arc::new(DefaultMapper),
            mapping: IndexMapping::default(),
            config,
            pool,
            scheduler,
        })
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn DocumentMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_mapping(mut self, mapping: IndexMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Share an active-rebuild set with other engines.
    pub fn with_active_set(mut self, active: ActiveRebuildSet) -> Self {
        self.scheduler = RebuildScheduler::new(Arc::clone(&self.pool), active);
        self
    }

    pub fn on_rebuild_complete(mut self, callback: CompletionCallback) -> Self {
        self.scheduler = self.scheduler.on_complete(callback);
        self
    }

    pub fn active_rebuilds(&self) -> &ActiveRebuildSet {
        self.scheduler.active()
    }

    fn resource(&self, resource_id: &str) -> Result<Resource> {
        self.config_db
            .get_resource(resource_id)?
            .ok_or_else(|| Error::not_found("resource", resource_id))
    }

    /// Schedule a full rebuild; `None` while the resource is rebuilding or
    /// in the middle of a sync cycle.
    pub fn request_rebuild(
        &self,
        resource_id: &str,
    ) -> Result<Option<RebuildHandle>> {
        let resource = self.resource(resource_id)?;
        let task = self.rebuild_task(&resource)?;
        Ok(self.scheduler.submit(&resource.id, task))
    }

    fn rebuild_task(
        &self,
        resource: &Resource,
    ) -> Result<impl FnOnce() -> RebuildOutcome + Send + 'static> {
        let provider = self.providers.get(&resource.backend)?;
        let backend = Arc::clone(&self.backend);
        let mapper = Arc::clone(&self.mapper);
        let mapping = self.mapping.clone();
        let config = self.config.clone();
        let resource = resource.clone();

        Ok(move || {
            BuildCoordinator::new(backend.aliases()).rebuild(
                &resource.alias,
                &mapping,
                |index| {
                    populate_from_provider(
                        &*provider,
                        backend.sender(),
                        &resource,
                        &*mapper,
                        &config,
                        index,
                    )
                    .map(|_| ())
                },
            )
        })
    }

    /// Run every registered resource's cycle on the worker pool.
    pub fn synchronize_all(&self) -> Result<Vec<(String, Result<SyncReport>)>> {
        let resources = self.config_db.list_resources()?;
        Ok(self.pool.install(|| {
            resources
                .par_iter()
                .map(|resource| {
                    let outcome = self.synchronize(&resource.id);
                    if let Err(e) = &outcome {
                        warn!(resource = %resource.id, error = %e, "sync failed");
                    }
                    (resource.id.clone(), outcome)
                })
                .collect()
        }))
    }

    /// One reconciliation cycle for `resource_id`.
    ///
    /// The resource stays claimed from loading its events until they are
    /// retired; no rebuild of it can start in between.
    pub fn synchronize(&self, resource_id: &str) -> Result<SyncReport> {
        let resource = self.resource(resource_id)?;
        let provider = self.providers.get(&resource.backend)?;
        let mut report = SyncReport::new(resource_id);

        let claim = match self.scheduler.active().try_acquire_sync(resource_id) {
            Ok(claim) => claim,
            Err(Claim::Rebuild) => {
                // The running rebuild covers any REINDEX request.
                let batches = self.load_batches(&resource, &mut report)?;
                report.skipped_rebuilding = true;
                report.rebuild = RebuildStatus::AlreadyRunning;
                report.retired = self.retire(&reindex_sources(&batches));
                info!(resource = resource_id, "rebuild in progress, cycle skipped");
                return Ok(report);
            }
            Err(Claim::Sync) => {
                report.skipped_busy = true;
                info!(resource = resource_id, "another cycle is running, skipped");
                return Ok(report);
            }
        };

        let batches = self.load_batches(&resource, &mut report)?;
        let reindex = reindex_sources(&batches);
        let first_build = self
            .backend
            .aliases()
            .index_for_alias(&resource.alias)?
            .is_none();
        if first_build || !reindex.is_empty() {
            if first_build {
                info!(
                    resource = resource_id,
                    alias = %resource.alias,
                    "no index yet, rebuilding"
                );
            }
            let task = self.rebuild_task(&resource)?;
            let handle = self.scheduler.submit_claimed(claim.into_rebuild(), task);
            report.rebuild = RebuildStatus::Started(handle);
            report.retired = self.retire(&reindex);
            return Ok(report);
        }

        let acknowledged = Acknowledged::default();
        let mut no_ops = Vec::new();
        let flush = {
            let mut batcher =
                Batcher::new(self.backend.sender(), self.config.batch)
                    .with_hook(&acknowledged);
            for (source, merged) in batches {
                match self.resolve_batch(&*provider, &resource, &source, merged) {
                    Ok(resolved) => {
                        report.upserts += resolved.upserts;
                        report.deletes += resolved.deletes;
                        report.stale += resolved.stale;
                        if resolved.items.is_empty() {
                            no_ops.push(source);
                        }
                        for item in resolved.items {
                            batcher.add(item);
                        }
                    }
                    Err(e) => {
                        report.failed_batches += 1;
                        warn!(batch = %source, error = %e, "event batch failed, will retry");
                    }
                }
            }
            batcher.finish()
        };
        report.failed_items = flush.failed;

        let acknowledged = acknowledged
            .sources
            .into_inner()
            .unwrap_or_else(|p| p.into_inner());
        // A batch split across flushes retires only if none of them failed.
        let retire: Vec<SourceRef> = acknowledged
            .into_iter()
            .chain(no_ops)
            .filter(|source| !flush.failed_sources.contains(source))
            .collect();
        report.retired = self.retire(&retire);
        drop(claim);

        info!(
            resource = resource_id,
            upserts = report.upserts,
            deletes = report.deletes,
            retired = report.retired,
            failed = report.failed_items,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Pending batches for `resource`, each filtered to the resource's own
    /// events and merged.
    fn load_batches(
        &self,
        resource: &Resource,
        report: &mut SyncReport,
    ) -> Result<Vec<(SourceRef, Merged)>> {
        let pending = self.events.pending(&resource.id)?;
        let mut batches = Vec::with_capacity(pending.len());
        for source in pending {
            let mut batch = match self.events.load(&source) {
                Ok(batch) => batch,
                Err(e) => {
                    report.failed_batches += 1;
                    warn!(batch = %source, error = %e, "could not load event batch");
                    continue;
                }
            };
            report.malformed += batch.dropped;
            batch.events.retain(|event| {
                let ours = event.resource_id == resource.id;
                if !ours {
                    warn!(
                        batch = %batch.source,
                        resource = %event.resource_id,
                        "dropping event for another resource"
                    );
                }
                ours
            });
            report.events += batch.events.len();
            batches.push((batch.source, merge_events(batch.events)));
        }
        report.batches = batches.len();
        Ok(batches)
    }

    /// Expand and resolve one merged batch into index operations.
    fn resolve_batch(
        &self,
        provider: &dyn StorageProvider,
        resource: &Resource,
        source: &SourceRef,
        merged: Merged,
    ) -> Result<Resolved> {
        let alias = resource.alias.as_str();
        let expanded = expand_events(
            self.backend.lookup(),
            alias,
            merged.events,
            self.config.scroll_page_size,
        )?;
        let events = merge_events(expanded).events;

        let mut resolved = Resolved::default();
        for event in &events {
            self.resolve_event(provider, resource, event, source, &mut resolved)?;
        }
        debug!(
            batch = %source,
            events = events.len(),
            ops = resolved.items.len(),
            "batch resolved"
        );
        Ok(resolved)
    }

    /// Live file wins; otherwise drop whatever the index still holds.
    fn resolve_event(
        &self,
        provider: &dyn StorageProvider,
        resource: &Resource,
        event: &ChangeEvent,
        source: &SourceRef,
        resolved: &mut Resolved,
    ) -> Result<()> {
        let alias = resource.alias.as_str();
        let item = |op| {
            BatchItem::from_source(op, &resource.object_type, source.clone())
        };

        if let Some(record) = provider.stat(&resource.root, &event.path)? {
            resolved.upserts += 1;
            resolved
                .items
                .push(item(self.mapper.map(resource, alias, &record)));
            return Ok(());
        }

        let page = self
            .backend
            .lookup()
            .search(&IndexQuery::exact(alias, &event.path))?;
        if let Some(scroll) = page.scroll {
            self.backend.lookup().clear_scroll(scroll);
        }
        if page.hits.is_empty() {
            resolved.stale += 1;
            debug!(
                resource = %resource.id,
                path = %event.path,
                event = %event.event_type,
                "stale event, nothing to do"
            );
            return Ok(());
        }
        for hit in page.hits {
            resolved.deletes += 1;
            resolved
                .items
                .push(item(WriteOp::delete(alias, hit.doc_id)));
        }
        Ok(())
    }

    /// Returns how many batches were retired.
    fn retire(&self, sources: &[SourceRef]) -> usize {
        let mut retired = 0;
        for source in sources {
            match self.events.retire(source) {
                Ok(()) => retired += 1,
                Err(e) => warn!(batch = %source, error = %e, "could not retire batch"),
            }
        }
        retired
    }
}

/// Batches carrying a REINDEX request.
fn reindex_sources(batches: &[(SourceRef, Merged)]) -> Vec<SourceRef> {
    batches
        .iter()
        .filter(|(_, merged)| merged.wants_reindex())
        .map(|(source, _)| source.clone())
        .collect()
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("providers", &self.providers)
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    };

    use super::*;
    use crate::{
        engine::{
            AliasControl,
            DocumentSender,
            ScrollId,
            SearchLookup,
            SearchPage,
            TantivyEngine,
        },
        events::DirEventLog,
        model::{EventType, FileRecord, ItemOutcome},
        provider::{MemoryProvider, Paged, static_credential},
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        engine: Arc<TantivyEngine>,
        store: Arc<MemoryProvider>,
        log: Arc<DirEventLog>,
        sync: SyncEngine,
    }

    const ALIAS: &str = "docsync-r1";

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(TantivyEngine::in_memory().unwrap());
        let store = Arc::new(MemoryProvider::new(static_credential("t")));
        store.put("bucket", "/keep.txt", "k", &[]).unwrap();
        let log = Arc::new(DirEventLog::open(&tmp.path().join("events")).unwrap());
        let config_db = Arc::new(ConfigDb::open_in_memory().unwrap());
        config_db
            .set_resource(&Resource::new("r1", "memory", "bucket"))
            .unwrap();

        let sync = SyncEngine::new(
            config_db,
            engine.clone(),
            ProviderRegistry::new().with(store.clone()),
            log.clone(),
            SyncConfig::default(),
        )
        .unwrap();
        Fixture {
            _tmp: tmp,
            engine,
            store,
            log,
            sync,
        }
    }

    fn built() -> Fixture {
        let f = fixture();
        let report = f.sync.synchronize("r1").unwrap();
        report.rebuild.handle().unwrap().wait().unwrap();
        f
    }

    fn ev(t: i64, kind: EventType, path: &str) -> ChangeEvent {
        ChangeEvent::new(t, kind, "r1", path)
    }

    fn indexed(f: &Fixture, path: &str) -> bool {
        !f.engine
            .lookup()
            .search(&IndexQuery::exact(ALIAS, path))
            .unwrap()
            .hits
            .is_empty()
    }

    #[test]
    fn first_cycle_builds_index() {
        let f = fixture();
        let report = f.sync.synchronize("r1").unwrap();
        let handle = report.rebuild.handle().expect("rebuild launched");
        let build = handle.wait().unwrap();
        assert_eq!(build.alias, ALIAS);
        assert_eq!(f.engine.count(ALIAS).unwrap(), 1);
    }

    #[test]
    fn created_file_is_indexed_and_batch_retired() {
        let f = built();
        f.store.put("bucket", "/new.txt", "n", &[]).unwrap();
        f.log
            .append("r1", "agent", &[ev(1, EventType::Created, "/new.txt")])
            .unwrap();

        let report = f.sync.synchronize("r1").unwrap();
        assert_eq!(report.upserts, 1);
        assert_eq!(report.retired, 1);
        assert!(indexed(&f, "/new.txt"));
        assert!(f.log.pending("r1").unwrap().is_empty());
    }

    #[test]
    fn deleted_file_is_removed() {
        let f = built();
        f.store.delete("bucket", "/keep.txt").unwrap();
        f.log
            .append("r1", "agent", &[ev(1, EventType::Deleted, "/keep.txt")])
            .unwrap();

        let report = f.sync.synchronize("r1").unwrap();
        assert_eq!(report.deletes, 1);
        assert!(!indexed(&f, "/keep.txt"));
    }

    #[test]
    fn stale_event_is_a_retired_no_op() {
        let f = built();
        f.log
            .append("r1", "agent", &[ev(1, EventType::Deleted, "/never.txt")])
            .unwrap();
        let report = f.sync.synchronize("r1").unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.retired, 1);
    }

    #[test]
    fn reindex_while_rebuilding_is_dropped() {
        let f = built();
        let guard = f.sync.active_rebuilds().try_acquire("r1").unwrap();
        f.log
            .append("r1", "agent", &[ChangeEvent::new(1, EventType::Reindex, "r1", "")])
            .unwrap();
        f.log
            .append("r1", "other", &[ev(2, EventType::Created, "/keep.txt")])
            .unwrap();

        // Already rebuilding: the request is dropped, the plain batch waits.
        let report = f.sync.synchronize("r1").unwrap();
        assert!(report.skipped_rebuilding);
        assert!(matches!(report.rebuild, RebuildStatus::AlreadyRunning));
        assert_eq!(report.retired, 1);
        assert_eq!(f.log.pending("r1").unwrap().len(), 1);
        drop(guard);

        let report = f.sync.synchronize("r1").unwrap();
        assert!(!report.skipped_rebuilding);
        assert_eq!(report.upserts, 1);
    }

    #[test]
    fn unknown_resource_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.sync.synchronize("nope"),
            Err(Error::NotFound { kind: "resource", .. })
        ));
    }

    #[test]
    fn missing_backend_aborts_cycle() {
        let f = fixture();
        f.sync
            .config_db
            .set_resource(&Resource::new("r2", "s3", "bucket"))
            .unwrap();
        let results = f.sync.synchronize_all().unwrap();
        let (_, r2) = results.iter().find(|(id, _)| id == "r2").unwrap();
        assert!(matches!(r2, Err(Error::NotFound { kind: "backend", .. })));
        let (_, r1) = results.iter().find(|(id, _)| id == "r1").unwrap();
        assert!(r1.is_ok());
    }

    /// Fails every write; lookups and aliases go to the real engine.
    struct RejectingBackend(Arc<TantivyEngine>);

    impl DocumentSender for RejectingBackend {
        fn send_bulk(&self, _: &str, ops: &[WriteOp]) -> Result<Vec<ItemOutcome>> {
            Ok(ops
                .iter()
                .map(|op| ItemOutcome::failed(op.doc_id(), "cluster read-only"))
                .collect())
        }
    }

    impl SearchLookup for RejectingBackend {
        fn search(&self, q: &IndexQuery) -> Result<SearchPage> {
            self.0.search(q)
        }

        fn scroll_next(&self, s: ScrollId) -> Result<SearchPage> {
            self.0.scroll_next(s)
        }

        fn clear_scroll(&self, s: ScrollId) {
            self.0.clear_scroll(s)
        }
    }

    impl AliasControl for RejectingBackend {
        fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
            self.0.create_index(name, mapping)
        }

        fn index_for_alias(&self, alias: &str) -> Result<Option<String>> {
            self.0.index_for_alias(alias)
        }

        fn point_alias(&self, index: &str, alias: &str) -> Result<()> {
            self.0.point_alias(index, alias)
        }

        fn delete_index(&self, name: &str) -> Result<()> {
            self.0.delete_index(name)
        }

        fn index_exists(&self, name: &str) -> Result<bool> {
            self.0.index_exists(name)
        }
    }

    #[test]
    fn failed_writes_leave_batches_pending() {
        let f = built();
        let config_db = Arc::new(ConfigDb::open_in_memory().unwrap());
        config_db
            .set_resource(&Resource::new("r1", "memory", "bucket"))
            .unwrap();
        let rejecting = SyncEngine::new(
            config_db,
            Arc::new(RejectingBackend(f.engine.clone())),
            ProviderRegistry::new().with(f.store.clone()),
            f.log.clone(),
            SyncConfig::default(),
        )
        .unwrap();

        f.store.put("bucket", "/new.txt", "n", &[]).unwrap();
        f.log
            .append("r1", "agent", &[ev(1, EventType::Created, "/new.txt")])
            .unwrap();

        let report = rejecting.synchronize("r1").unwrap();
        assert_eq!(report.failed_items, 1);
        assert_eq!(report.retired, 0);
        assert_eq!(f.log.pending("r1").unwrap().len(), 1);

        // The healthy engine picks the batch up on its next cycle.
        let report = f.sync.synchronize("r1").unwrap();
        assert_eq!(report.retired, 1);
        assert!(indexed(&f, "/new.txt"));
    }

    /// Tags every document with its owning team.
    struct TeamMapper;

    impl DocumentMapper for TeamMapper {
        fn map(
            &self,
            resource: &Resource,
            index: &str,
            record: &FileRecord,
        ) -> WriteOp {
            let mut op = DefaultMapper.map(resource, index, record);
            if let WriteOp::Index { source, .. } = &mut op {
                source.insert("team".into(), serde_json::Value::from("search"));
            }
            op
        }
    }

    #[test]
    fn rebuild_uses_configured_mapper_and_mapping() {
        let Fixture { _tmp, engine, sync, .. } = fixture();
        let mapping = IndexMapping(serde_json::json!({ "dynamic": false }));
        let sync = sync
            .with_mapper(Arc::new(TeamMapper))
            .with_mapping(mapping.clone());

        let build = sync
            .synchronize("r1")
            .unwrap()
            .rebuild
            .handle()
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(
            engine.config_db().get_mapping(&build.index).unwrap(),
            Some(mapping.0.to_string())
        );
        let page = engine.search(&IndexQuery::exact(ALIAS, "/keep.txt")).unwrap();
        assert_eq!(page.hits[0].source["team"], "search");
    }

    #[test]
    fn shared_active_set_blocks_rebuilds() {
        let shared = ActiveRebuildSet::new();
        let Fixture { _tmp, sync, .. } = fixture();
        let sync = sync.with_active_set(shared.clone());

        let guard = shared.try_acquire("r1").unwrap();
        assert!(sync.request_rebuild("r1").unwrap().is_none());
        assert!(sync.active_rebuilds().is_active("r1"));
        drop(guard);

        sync.request_rebuild("r1").unwrap().unwrap().wait().unwrap();
        assert!(!shared.is_active("r1"));
    }

    /// Pauses the first `stat` until the test lets it go.
    struct PausingProvider {
        inner: Arc<MemoryProvider>,
        armed: AtomicBool,
        entered: Barrier,
        release: Barrier,
    }

    impl StorageProvider for PausingProvider {
        fn backend(&self) -> &str {
            self.inner.backend()
        }

        fn list(&self, root: &str, prefix: &str) -> Result<Paged<FileRecord>> {
            self.inner.list(root, prefix)
        }

        fn list_versions(
            &self,
            root: &str,
            prefix: &str,
            include_deleted: bool,
        ) -> Result<Paged<FileRecord>> {
            self.inner.list_versions(root, prefix, include_deleted)
        }

        fn read_content(
            &self,
            root: &str,
            path: &str,
        ) -> Result<Box<dyn std::io::Read + Send>> {
            self.inner.read_content(root, path)
        }

        fn delete(&self, root: &str, path: &str) -> Result<()> {
            self.inner.delete(root, path)
        }

        fn stat(&self, root: &str, path: &str) -> Result<Option<FileRecord>> {
            if self.armed.swap(false, AtomicOrdering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
            self.inner.stat(root, path)
        }
    }

    #[test]
    fn rebuild_cannot_start_during_a_cycle() {
        let f = built();
        let pausing = Arc::new(PausingProvider {
            inner: f.store.clone(),
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let config_db = Arc::new(ConfigDb::open_in_memory().unwrap());
        config_db
            .set_resource(&Resource::new("r1", "memory", "bucket"))
            .unwrap();
        let sync = Arc::new(
            SyncEngine::new(
                config_db,
                f.engine.clone(),
                ProviderRegistry::new().with(pausing.clone()),
                f.log.clone(),
                SyncConfig::default(),
            )
            .unwrap(),
        );

        f.store.put("bucket", "/new.txt", "n", &[]).unwrap();
        f.log
            .append("r1", "agent", &[ev(1, EventType::Created, "/new.txt")])
            .unwrap();

        let cycle = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || sync.synchronize("r1"))
        };
        pausing.entered.wait();
        assert!(sync.active_rebuilds().is_syncing("r1"));
        assert!(sync.request_rebuild("r1").unwrap().is_none());
        let concurrent = sync.synchronize("r1").unwrap();
        assert!(concurrent.skipped_busy);
        assert_eq!(concurrent.batches, 0);
        pausing.release.wait();

        let report = cycle.join().unwrap().unwrap();
        assert_eq!(report.upserts, 1);
        assert_eq!(report.retired, 1);
        assert_eq!(sync.active_rebuilds().holder("r1"), None);
        assert!(indexed(&f, "/new.txt"));

        sync.request_rebuild("r1").unwrap().unwrap().wait().unwrap();
        assert!(indexed(&f, "/new.txt"));
    }
}
