//! Background full rebuilds, at most one per resource.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        mpsc::{self, Receiver, TryRecvError},
    },
};

use tracing::{debug, error, info};

use crate::{
    build::BuildReport,
    error::{Error, Result},
};

/// What currently holds a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Rebuild,
    /// An incremental reconciliation cycle.
    Sync,
}

/// Per-resource exclusion between rebuilds and sync cycles. A resource is
/// held by at most one of them at a time. Cloning shares the set.
#[derive(Debug, Clone, Default)]
pub struct ActiveRebuildSet {
    inner: Arc<Mutex<HashMap<String, Claim>>>,
}

impl ActiveRebuildSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Claim>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn claim(
        &self,
        resource_id: &str,
        kind: Claim,
    ) -> std::result::Result<Held, Claim> {
        match self.lock().entry(resource_id.to_string()) {
            Entry::Occupied(held) => Err(*held.get()),
            Entry::Vacant(slot) => {
                slot.insert(kind);
                Ok(Held {
                    set: self.clone(),
                    resource_id: resource_id.to_string(),
                })
            }
        }
    }

    /// Claim `resource_id` for a rebuild; `None` if it is already held.
    pub fn try_acquire(&self, resource_id: &str) -> Option<RebuildGuard> {
        self.claim(resource_id, Claim::Rebuild).ok().map(RebuildGuard)
    }

    /// Claim `resource_id` for a sync cycle, or report what holds it.
    pub fn try_acquire_sync(
        &self,
        resource_id: &str,
    ) -> std::result::Result<SyncGuard, Claim> {
        self.claim(resource_id, Claim::Sync).map(SyncGuard)
    }

    pub fn holder(&self, resource_id: &str) -> Option<Claim> {
        self.lock().get(resource_id).copied()
    }

    /// True while a rebuild holds `resource_id`.
    pub fn is_active(&self, resource_id: &str) -> bool {
        self.holder(resource_id) == Some(Claim::Rebuild)
    }

    pub fn is_syncing(&self, resource_id: &str) -> bool {
        self.holder(resource_id) == Some(Claim::Sync)
    }

    /// Resources with a rebuild in flight, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, claim)| **claim == Claim::Rebuild)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// A slot in the set, released on drop.
struct Held {
    set: ActiveRebuildSet,
    resource_id: String,
}

impl Drop for Held {
    fn drop(&mut self) {
        self.set.lock().remove(&self.resource_id);
        debug!(resource = %self.resource_id, "resource slot released");
    }
}

/// Rebuild membership in an [`ActiveRebuildSet`], released on drop.
#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct RebuildGuard(Held);

impl RebuildGuard {
    pub fn resource_id(&self) -> &str {
        &self.0.resource_id
    }
}

impl fmt::Debug for RebuildGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebuildGuard")
            .field("resource_id", &self.0.resource_id)
            .finish()
    }
}

/// Sync-cycle membership in an [`ActiveRebuildSet`], released on drop.
#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct SyncGuard(Held);

impl SyncGuard {
    pub fn resource_id(&self) -> &str {
        &self.0.resource_id
    }

    /// Hand the slot to a rebuild without releasing it in between.
    pub fn into_rebuild(self) -> RebuildGuard {
        self.0
            .set
            .lock()
            .insert(self.0.resource_id.clone(), Claim::Rebuild);
        RebuildGuard(self.0)
    }
}

impl fmt::Debug for SyncGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncGuard")
            .field("resource_id", &self.0.resource_id)
            .finish()
    }
}

pub type RebuildOutcome = Result<BuildReport>;

/// Observer for finished rebuilds, called on the worker thread.
pub type CompletionCallback = Arc<dyn Fn(&str, &RebuildOutcome) + Send + Sync>;

/// Receiving end of a submitted rebuild.
#[derive(Debug)]
pub struct RebuildHandle {
    resource_id: String,
    rx: Receiver<RebuildOutcome>,
}

impl RebuildHandle {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Block until the rebuild finishes.
    pub fn wait(self) -> RebuildOutcome {
        self.rx.recv().unwrap_or_else(|_| {
            Err(Error::Build {
                alias: self.resource_id.clone(),
                message: "rebuild task vanished".into(),
            })
        })
    }

    /// The outcome if the rebuild has finished, without blocking.
    pub fn try_outcome(&self) -> Option<RebuildOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Build {
                alias: self.resource_id.clone(),
                message: "rebuild task vanished".into(),
            })),
        }
    }
}

/// Runs rebuild tasks on a shared worker pool.
#[derive(Clone)]
pub struct RebuildScheduler {
    pool: Arc<rayon::ThreadPool>,
    active: ActiveRebuildSet,
    on_complete: Option<CompletionCallback>,
}

impl RebuildScheduler {
    pub fn new(pool: Arc<rayon::ThreadPool>, active: ActiveRebuildSet) -> Self {
        Self {
            pool,
            active,
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn active(&self) -> &ActiveRebuildSet {
        &self.active
    }

    /// Start `task` for `resource_id` unless a rebuild or a sync cycle holds
    /// the resource.
    ///
    /// The slot is held until the task returns or panics, and is released
    /// before the outcome is published.
    pub fn submit<F>(&self, resource_id: &str, task: F) -> Option<RebuildHandle>
    where
        F: FnOnce() -> RebuildOutcome + Send + 'static,
    {
        match self.active.try_acquire(resource_id) {
            Some(guard) => Some(self.submit_claimed(guard, task)),
            None => {
                debug!(resource = resource_id, "resource busy, rebuild refused");
                None
            }
        }
    }

    /// Start `task` under a slot the caller already holds.
    pub fn submit_claimed<F>(&self, guard: RebuildGuard, task: F) -> RebuildHandle
    where
        F: FnOnce() -> RebuildOutcome + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let on_complete = self.on_complete.clone();
        let id = guard.resource_id().to_string();

        info!(resource = %id, "rebuild scheduled");
        let guard_id = id.clone();
        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task))
                .unwrap_or_else(|panic| {
                    Err(Error::Build {
                        alias: id.clone(),
                        message: format!("panicked: {}", panic_message(&*panic)),
                    })
                });
            drop(guard);

            match &outcome {
                Ok(report) => {
                    info!(resource = %id, index = %report.index, "rebuild finished")
                }
                Err(e) => error!(resource = %id, error = %e, "rebuild failed"),
            }
            if let Some(callback) = on_complete {
                callback(&id, &outcome);
            }
            // Nobody may be waiting.
            let _ = tx.send(outcome);
        });

        RebuildHandle {
            resource_id: guard_id,
            rx,
        }
    }
}

impl fmt::Debug for RebuildScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebuildScheduler")
            .field("threads", &self.pool.current_num_threads())
            .field("active", &self.active.active())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// Worker pool shared by sync cycles and rebuilds.
pub fn build_pool(threads: usize) -> Result<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("docsync-worker-{i}"))
        .build()
        .map(Arc::new)
        .map_err(|e| Error::Config(format!("failed to build worker pool: {e}")))
}
