//! Full index rebuilds behind a stable alias.
//!
//! A rebuild populates a freshly named concrete index, repoints the alias
//! at it and only then deletes the previous index. Until the swap, readers
//! keep seeing the old index; after it, the new one. A failed rebuild
//! deletes its half-built index and leaves the alias where it was.

use std::fmt;

use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, warn};

use crate::{
    batcher::{BatchItem, Batcher},
    config::SyncConfig,
    engine::{AliasControl, DocumentSender, IndexMapping},
    error::{Error, Result},
    mapper::DocumentMapper,
    model::Resource,
    provider::StorageProvider,
};

const SUFFIX_LEN: usize = 8;
const MAX_NAME_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Start,
    Building,
    Populating,
    AliasSwapped,
    Done,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Building => "building",
            Self::Populating => "populating",
            Self::AliasSwapped => "alias-swapped",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub alias: String,
    pub index: String,
    /// Index the alias pointed at before the swap.
    pub previous: Option<String>,
    /// False when the previous index could not be deleted.
    pub previous_deleted: bool,
}

pub struct BuildCoordinator<'a> {
    aliases: &'a dyn AliasControl,
}

impl<'a> BuildCoordinator<'a> {
    pub fn new(aliases: &'a dyn AliasControl) -> Self {
        Self { aliases }
    }

    /// Build a new index for `alias`, fill it with `populate` and swap the
    /// alias over. `populate` receives the new concrete index name.
    pub fn rebuild<F>(
        &self,
        alias: &str,
        mapping: &IndexMapping,
        populate: F,
    ) -> Result<BuildReport>
    where
        F: FnOnce(&str) -> Result<()>,
    {
        let mut state = BuildState::Start;
        let previous = self.aliases.index_for_alias(alias)?;
        debug!(alias, previous = ?previous, %state, "rebuild starting");

        let mut created: Option<String> = None;
        let swapped = self.build_and_swap(
            alias,
            mapping,
            populate,
            &mut state,
            &mut created,
        );

        let index = match swapped {
            Ok(index) => index,
            Err(e) => {
                transition(alias, &mut state, BuildState::Failed);
                if let Some(name) = created {
                    if let Err(cleanup) = self.aliases.delete_index(&name) {
                        warn!(
                            alias,
                            index = %name,
                            error = %cleanup,
                            "could not delete partial index"
                        );
                    }
                }
                return Err(match e {
                    e @ Error::Build { .. } => e,
                    other => Error::Build {
                        alias: alias.to_string(),
                        message: other.to_string(),
                    },
                });
            }
        };

        let mut previous_deleted = true;
        if let Some(old) = previous.as_deref().filter(|old| *old != index) {
            if let Err(e) = self.aliases.delete_index(old) {
                previous_deleted = false;
                warn!(alias, index = old, error = %e, "could not delete old index");
            }
        }
        transition(alias, &mut state, BuildState::Done);
        info!(alias, index = %index, "rebuild complete");

        Ok(BuildReport {
            alias: alias.to_string(),
            index,
            previous,
            previous_deleted,
        })
    }

    fn build_and_swap<F>(
        &self,
        alias: &str,
        mapping: &IndexMapping,
        populate: F,
        state: &mut BuildState,
        created: &mut Option<String>,
    ) -> Result<String>
    where
        F: FnOnce(&str) -> Result<()>,
    {
        transition(alias, state, BuildState::Building);
        let name = self.fresh_name(alias)?;
        self.aliases.create_index(&name, mapping)?;
        *created = Some(name.clone());

        transition(alias, state, BuildState::Populating);
        populate(&name)?;

        self.aliases.point_alias(&name, alias)?;
        transition(alias, state, BuildState::AliasSwapped);
        Ok(name)
    }

    fn fresh_name(&self, alias: &str) -> Result<String> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = format!("{alias}-{}", random_suffix());
            if !self.aliases.index_exists(&name)? {
                return Ok(name);
            }
            debug!(alias, index = %name, "index name collision, retrying");
        }
        Err(Error::Build {
            alias: alias.to_string(),
            message: "could not generate an unused index name".into(),
        })
    }
}

fn transition(alias: &str, state: &mut BuildState, next: BuildState) {
    debug!(alias, from = %state, to = %next, "build state");
    *state = next;
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Standard populate step: index every live file of the resource.
///
/// Fails if any document could not be written, so the caller's rebuild is
/// abandoned rather than swapping in an incomplete index.
pub fn populate_from_provider(
    provider: &dyn StorageProvider,
    sender: &dyn DocumentSender,
    resource: &Resource,
    mapper: &dyn DocumentMapper,
    config: &SyncConfig,
    index: &str,
) -> Result<usize> {
    let mut batcher = Batcher::new(sender, config.batch);
    let mut listed = 0;
    for record in provider.list(&resource.root, "")? {
        let record = record?;
        if record.is_delete_marker {
            continue;
        }
        listed += 1;
        batcher.add(BatchItem::new(
            mapper.map(resource, index, &record),
            &resource.object_type,
        ));
    }
    let report = batcher.finish();

    if !report.is_clean() {
        return Err(Error::Build {
            alias: resource.alias.clone(),
            message: format!(
                "{} of {} documents failed to index",
                report.failed, report.sent
            ),
        });
    }
    debug!(resource = %resource.id, index, documents = listed, "populated");
    Ok(listed)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            Barrier,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    use serde_json::{Map, Value};

    use super::*;
    use crate::{
        engine::{IndexQuery, SearchLookup, TantivyEngine},
        mapper::DefaultMapper,
        model::WriteOp,
        provider::{MemoryProvider, static_credential},
    };

    fn doc(index: &str, path: &str) -> WriteOp {
        let mut source = Map::new();
        source.insert("path".into(), Value::from(path));
        WriteOp::index(index, path.trim_start_matches('/'), source)
    }

    fn build_with(engine: &TantivyEngine, paths: &[&str]) -> BuildReport {
        BuildCoordinator::new(engine)
            .rebuild("files", &IndexMapping::default(), |index| {
                let ops: Vec<WriteOp> =
                    paths.iter().map(|p| doc(index, p)).collect();
                engine.send_bulk(index, &ops)?;
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn first_build_creates_alias() {
        let engine = TantivyEngine::in_memory().unwrap();
        let report = build_with(&engine, &["/a", "/b"]);

        assert!(report.index.starts_with("files-"));
        let suffix = &report.index["files-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(report.previous, None);
        assert_eq!(engine.index_for_alias("files").unwrap(), Some(report.index));
        assert_eq!(engine.count("files").unwrap(), 2);
    }

    #[test]
    fn rebuild_swaps_and_deletes_old_index() {
        let engine = TantivyEngine::in_memory().unwrap();
        let first = build_with(&engine, &["/a"]);
        let second = build_with(&engine, &["/a", "/b", "/c"]);

        assert_eq!(second.previous.as_deref(), Some(first.index.as_str()));
        assert!(second.previous_deleted);
        assert!(!engine.index_exists(&first.index).unwrap());
        assert_eq!(engine.count("files").unwrap(), 3);
    }

    #[test]
    fn failed_populate_leaves_alias_untouched() {
        let engine = TantivyEngine::in_memory().unwrap();
        let first = build_with(&engine, &["/a"]);

        let mut attempted = None;
        let result = BuildCoordinator::new(&engine).rebuild(
            "files",
            &IndexMapping::default(),
            |index| {
                attempted = Some(index.to_string());
                Err(Error::Search("source unreachable".into()))
            },
        );

        assert!(matches!(result, Err(Error::Build { .. })));
        let attempted = attempted.unwrap();
        assert!(!engine.index_exists(&attempted).unwrap());
        assert_eq!(
            engine.index_for_alias("files").unwrap(),
            Some(first.index.clone())
        );
        assert!(engine.index_exists(&first.index).unwrap());
        assert_eq!(engine.count("files").unwrap(), 1);
    }

    #[test]
    fn readers_see_old_or_new_never_partial() {
        let engine = Arc::new(TantivyEngine::in_memory().unwrap());
        build_with(&engine, &["/old-1", "/old-2"]);

        let done = Arc::new(AtomicBool::new(false));
        let start = Arc::new(Barrier::new(2));
        let reader = {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut seen = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    let page = engine
                        .search(&IndexQuery::prefix("files", "/", 100))
                        .unwrap();
                    if let Some(scroll) = page.scroll {
                        engine.clear_scroll(scroll);
                    }
                    seen.push(page.hits.len());
                }
                seen
            })
        };

        start.wait();
        BuildCoordinator::new(&*engine)
            .rebuild("files", &IndexMapping::default(), |index| {
                // Two separate commits; a reader on the new index between
                // them would see a partial result.
                engine.send_bulk(index, &[doc(index, "/new-1")])?;
                engine.send_bulk(
                    index,
                    &[doc(index, "/new-2"), doc(index, "/new-3")],
                )?;
                Ok(())
            })
            .unwrap();
        done.store(true, Ordering::SeqCst);

        let seen = reader.join().unwrap();
        assert!(seen.iter().all(|&n| n == 2 || n == 3), "saw {seen:?}");
        assert_eq!(engine.count("files").unwrap(), 3);
    }

    #[test]
    fn populate_from_provider_indexes_live_files() {
        let engine = TantivyEngine::in_memory().unwrap();
        let store = MemoryProvider::new(static_credential("t"));
        store.put("bucket", "/a.txt", "a", &[]).unwrap();
        store.put("bucket", "/b.txt", "b", &[]).unwrap();
        store.put("bucket", "/gone.txt", "x", &[]).unwrap();
        store.delete("bucket", "/gone.txt").unwrap();

        let resource = Resource::new("r1", "memory", "bucket");
        let config = SyncConfig::default();
        let mut populated = 0;
        BuildCoordinator::new(&engine)
            .rebuild(&resource.alias, &IndexMapping::default(), |index| {
                populated = populate_from_provider(
                    &store,
                    &engine,
                    &resource,
                    &DefaultMapper,
                    &config,
                    index,
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(populated, 2);
        assert_eq!(engine.count(&resource.alias).unwrap(), 2);
    }
}
