//! docsync - keeps search indexes in sync with remote file-backed resources.
//!
//! Resources (object-store buckets, mounted network exports) change behind
//! the index's back. Producers report those changes as an unordered,
//! at-least-once stream of [`ChangeEvent`]s; docsync folds them into the
//! minimal set of index writes and, when asked, rebuilds a resource's index
//! from scratch without ever exposing a half-built one.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docsync::{
//!     ConfigDb, DataDir, DirEventLog, LocalProvider, ProviderRegistry,
//!     Resource, SyncConfig, SyncEngine, TantivyEngine,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config_db = Arc::new(ConfigDb::open(&data_dir.config_db()).unwrap());
//! config_db
//!     .set_resource(&Resource::new("docs", "nfs", "/mnt/docs"))
//!     .unwrap();
//!
//! let config = SyncConfig::load(&config_db).unwrap();
//! let engine = Arc::new(
//!     TantivyEngine::open(
//!         &data_dir.indices_dir().unwrap(),
//!         Arc::clone(&config_db),
//!         config.writer_memory,
//!     )
//!     .unwrap(),
//! );
//! let events = Arc::new(DirEventLog::open(&data_dir.events_dir().unwrap()).unwrap());
//! let providers = ProviderRegistry::new().with(Arc::new(LocalProvider::new()));
//!
//! let sync = SyncEngine::new(config_db, engine, providers, events, config).unwrap();
//! let report = sync.synchronize("docs").unwrap();
//! if let Some(rebuild) = report.rebuild.handle() {
//!     rebuild.wait().unwrap();
//! }
//! ```

pub mod batcher;
pub mod build;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod doc_id;
pub mod engine;
pub mod error;
pub mod events;
pub mod mapper;
pub mod model;
pub mod provider;
pub mod rebuild;
pub mod reconcile;

pub use batcher::{BatchItem, BatchLimits, Batcher, FlushReport, PostFlushHook};
pub use build::{BuildCoordinator, BuildReport, populate_from_provider};
pub use config::SyncConfig;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use engine::{SearchBackend, TantivyEngine};
pub use error::{Error, Result};
pub use events::{DirEventLog, EventLog};
pub use mapper::{DefaultMapper, DocumentMapper};
pub use model::{ChangeEvent, EventType, FileRecord, Resource, WriteOp};
pub use provider::{
    LocalProvider,
    MemoryProvider,
    ProviderRegistry,
    StorageProvider,
};
pub use rebuild::{ActiveRebuildSet, RebuildHandle, RebuildScheduler};
pub use reconcile::{SyncEngine, SyncReport};
