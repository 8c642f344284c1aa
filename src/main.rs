use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use docsync::{
    ConfigDb,
    DataDir,
    DirEventLog,
    LocalProvider,
    ProviderRegistry,
    Resource,
    SyncConfig,
    SyncEngine,
    SyncReport,
    TantivyEngine,
    config,
    engine::AliasControl,
    error::{Error, Result},
    events::EventLog,
    model::{ChangeEvent, EventType},
    rebuild::RebuildOutcome,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, EventsAction, ResourceAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCSYNC_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Everything a sync or rebuild command needs, opened once.
struct Runtime {
    engine: Arc<TantivyEngine>,
    sync: Arc<SyncEngine>,
    events: Arc<DirEventLog>,
}

impl Runtime {
    fn open(data_dir: &DataDir, config_db: Arc<ConfigDb>) -> Result<Self> {
        let config = SyncConfig::load(&config_db)?;
        let engine = Arc::new(TantivyEngine::open(
            &data_dir.indices_dir()?,
            Arc::clone(&config_db),
            config.writer_memory,
        )?);
        let events = Arc::new(DirEventLog::open(&data_dir.events_dir()?)?);
        let sync = SyncEngine::new(
            config_db,
            engine.clone(),
            providers(),
            events.clone(),
            config,
        )?
        .on_rebuild_complete(Arc::new(|resource: &str, outcome: &RebuildOutcome| {
            if let Ok(report) = outcome {
                info!(resource, index = %report.index, "alias now serves new index");
            }
        }));
        Ok(Self {
            engine,
            sync: Arc::new(sync),
            events,
        })
    }
}

fn providers() -> ProviderRegistry {
    ProviderRegistry::new().with(Arc::new(LocalProvider::new()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = Arc::new(ConfigDb::open(&data_dir.config_db())?);

    match cli.command {
        Command::Resource { action } => match action {
            ResourceAction::Add {
                id,
                backend,
                root,
                alias,
            } => {
                resource_add(&config_db, &id, &backend, &root, alias)?;
            }
            ResourceAction::Remove { id } => {
                let runtime = Runtime::open(&data_dir, Arc::clone(&config_db))?;
                resource_remove(&config_db, &runtime, &id)?;
            }
            ResourceAction::List { json } => {
                resource_list(&config_db, json)?;
            }
        },
        Command::Sync(args) => {
            let runtime = Runtime::open(&data_dir, config_db)?;
            match args.watch {
                Some(secs) => {
                    watch(&runtime.sync, args.resource, secs)?;
                }
                None => {
                    run_cycle(&runtime.sync, args.resource.as_deref(), true)?;
                }
            }
        }
        Command::Rebuild(args) => {
            let runtime = Runtime::open(&data_dir, Arc::clone(&config_db))?;
            cmd_rebuild(&config_db, &runtime, args.resource.as_deref())?;
        }
        Command::Events { action } => match action {
            EventsAction::Push {
                resource,
                event_type,
                path,
                to,
                producer,
            } => {
                events_push(
                    &config_db, &data_dir, &resource, event_type, &path, to,
                    &producer,
                )?;
            }
        },
        Command::Search(args) => {
            let runtime = Runtime::open(&data_dir, Arc::clone(&config_db))?;
            cmd_search(&config_db, &runtime, &args)?;
        }
        Command::Status(args) => {
            let runtime = Runtime::open(&data_dir, Arc::clone(&config_db))?;
            cmd_status(&config_db, &data_dir, &runtime, args.json)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Set { key, value } => {
                config::validate_setting(&key, &value)?;
                config_db.set_setting(&key, &value)?;
                println!("{key} = {value}");
            }
            ConfigAction::Get { key: Some(key) } => {
                let value = config_db
                    .get_setting(&key)?
                    .ok_or_else(|| Error::NotFound {
                        kind: "setting",
                        name: key.clone(),
                    })?;
                println!("{value}");
            }
            ConfigAction::Get { key: None } => {
                for (key, value) in config_db.list_settings()? {
                    println!("{key} = {value}");
                }
            }
        },
        Command::Completions(args) => args.generate(),
    }

    Ok(())
}

fn resource_add(
    config_db: &ConfigDb,
    id: &str,
    backend: &str,
    root: &str,
    alias: Option<String>,
) -> Result<()> {
    if config_db.get_resource(id)?.is_some() {
        return Err(Error::Config(format!("resource '{id}' already exists")));
    }
    // Fails with NotFound for unknown backends.
    providers().get(backend)?;

    let mut root = root.to_string();
    if backend == "nfs" {
        let path = Path::new(&root);
        if !path.is_dir() {
            return Err(Error::Config(format!(
                "export directory does not exist: {}",
                path.display()
            )));
        }
        root = path
            .canonicalize()
            .map_err(|e| {
                Error::Config(format!("cannot resolve path {}: {e}", path.display()))
            })?
            .to_string_lossy()
            .to_string();
    }

    let mut resource = Resource::new(id, backend, &root);
    if let Some(alias) = alias {
        resource.alias = alias;
    }
    config_db.set_resource(&resource)?;

    println!("Added resource '{id}' ({backend}: {root}) as '{}'", resource.alias);
    Ok(())
}

fn resource_remove(
    config_db: &ConfigDb,
    runtime: &Runtime,
    id: &str,
) -> Result<()> {
    let resource = config_db.get_resource(id)?.ok_or_else(|| Error::NotFound {
        kind: "resource",
        name: id.to_string(),
    })?;
    if let Some(index) = runtime.engine.index_for_alias(&resource.alias)? {
        config_db.remove_alias(&resource.alias)?;
        runtime.engine.delete_index(&index)?;
    }
    config_db.remove_resource(id)?;

    println!("Removed resource '{id}'");
    Ok(())
}

fn resource_list(config_db: &ConfigDb, json: bool) -> Result<()> {
    let resources = config_db.list_resources()?;

    if json {
        println!("{}", serde_json::to_string(&resources)?);
    } else if resources.is_empty() {
        println!("No resources registered.");
    } else {
        for r in &resources {
            println!("{}\t{}\t{}\t{}", r.id, r.backend, r.root, r.alias);
        }
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.skipped_rebuilding {
        eprintln!("{}: rebuild in progress, skipped", report.resource_id);
        return;
    }
    if report.skipped_busy {
        eprintln!("{}: another sync is running, skipped", report.resource_id);
        return;
    }
    eprintln!(
        "{}: {} batch(es), {} upsert(s), {} delete(s), {} stale, {} retired, {} failed",
        report.resource_id,
        report.batches,
        report.upserts,
        report.deletes,
        report.stale,
        report.retired,
        report.failed_items + report.failed_batches,
    );
}

/// One sync pass. With `wait`, blocks on any rebuild the pass launched.
fn run_cycle(
    sync: &SyncEngine,
    resource: Option<&str>,
    wait: bool,
) -> Result<()> {
    let results = match resource {
        Some(id) => vec![(id.to_string(), sync.synchronize(id))],
        None => sync.synchronize_all()?,
    };
    if results.is_empty() {
        eprintln!("No resources to sync.");
    }

    for (id, outcome) in results {
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Error syncing '{id}': {e}");
                continue;
            }
        };
        print_report(&report);
        let Some(handle) = report.rebuild.handle() else {
            continue;
        };
        if wait {
            eprintln!("{id}: building index...");
            match handle.wait() {
                Ok(build) => eprintln!("{id}: alias {} -> {}", build.alias, build.index),
                Err(e) => eprintln!("{id}: rebuild failed: {e}"),
            }
        }
    }
    Ok(())
}

fn watch(
    sync: &Arc<SyncEngine>,
    resource: Option<String>,
    secs: u64,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        info!(interval = secs, "watching for changes");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sync = Arc::clone(sync);
                    let resource = resource.clone();
                    let cycle = tokio::task::spawn_blocking(move || {
                        run_cycle(&sync, resource.as_deref(), false)
                    });
                    match cycle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "sync cycle failed"),
                        Err(e) => error!(error = %e, "sync cycle panicked"),
                    }
                }
                _ = &mut shutdown => {
                    info!("interrupted, stopping");
                    break;
                }
            }
        }
    });
    Ok(())
}

fn cmd_rebuild(
    config_db: &ConfigDb,
    runtime: &Runtime,
    resource: Option<&str>,
) -> Result<()> {
    let ids: Vec<String> = match resource {
        Some(id) => vec![id.to_string()],
        None => config_db.list_resources()?.into_iter().map(|r| r.id).collect(),
    };
    if ids.is_empty() {
        eprintln!("No resources to rebuild.");
        return Ok(());
    }

    let mut handles = Vec::new();
    for id in &ids {
        match runtime.sync.request_rebuild(id)? {
            Some(handle) => handles.push(handle),
            None => eprintln!("{id}: rebuild already running"),
        }
    }
    for handle in handles {
        let id = handle.resource_id().to_string();
        match handle.wait() {
            Ok(build) => {
                let count = runtime.engine.count(&build.alias)?;
                eprintln!("{id}: {count} documents, alias {} -> {}", build.alias, build.index);
            }
            Err(e) => eprintln!("{id}: rebuild failed: {e}"),
        }
    }
    Ok(())
}

fn events_push(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    resource: &str,
    event_type: EventType,
    path: &str,
    to: Option<String>,
    producer: &str,
) -> Result<()> {
    if config_db.get_resource(resource)?.is_none() {
        return Err(Error::NotFound {
            kind: "resource",
            name: resource.to_string(),
        });
    }
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64);

    let event = match (event_type, to) {
        (EventType::FolderMoved, Some(to)) => {
            ChangeEvent::folder_moved(timestamp, resource, path, &to)
        }
        (EventType::FolderMoved, None) => {
            return Err(Error::Config("folder-moved needs --to".into()));
        }
        (event_type, _) => ChangeEvent::new(timestamp, event_type, resource, path),
    };

    let log = DirEventLog::open(&data_dir.events_dir()?)?;
    let source = log.append(resource, producer, &[event])?;
    println!("Queued {event_type} as {source}");
    Ok(())
}

fn cmd_search(
    config_db: &ConfigDb,
    runtime: &Runtime,
    args: &cli::SearchArgs,
) -> Result<()> {
    let resource =
        config_db.get_resource(&args.resource)?.ok_or_else(|| Error::NotFound {
            kind: "resource",
            name: args.resource.clone(),
        })?;
    let hits = runtime
        .engine
        .search_text(&resource.alias, &args.query, args.count)?;

    if args.json {
        let rows: Vec<serde_json::Value> = hits
            .iter()
            .map(|h| {
                serde_json::json!({
                    "score": h.score,
                    "doc_id": h.doc_id,
                    "path": h.path,
                    "name": h.name,
                    "mtime": h.mtime,
                })
            })
            .collect();
        println!("{}", serde_json::Value::Array(rows));
    } else if hits.is_empty() {
        println!("No results.");
    } else {
        for h in &hits {
            println!("{:.3}\t{}", h.score, h.path);
        }
    }
    Ok(())
}

fn cmd_status(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    runtime: &Runtime,
    json: bool,
) -> Result<()> {
    let resources = config_db.list_resources()?;
    let mut rows = Vec::with_capacity(resources.len());
    for r in &resources {
        let index = runtime.engine.index_for_alias(&r.alias)?;
        let documents = match &index {
            Some(_) => Some(runtime.engine.count(&r.alias)?),
            None => None,
        };
        let pending = runtime.events.pending(&r.id)?.len();
        rows.push((r, index, documents, pending));
    }

    if json {
        let resources: Vec<serde_json::Value> = rows
            .iter()
            .map(|(r, index, documents, pending)| {
                serde_json::json!({
                    "id": r.id,
                    "backend": r.backend,
                    "alias": r.alias,
                    "index": index,
                    "documents": documents,
                    "pending_batches": pending,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "data_dir": data_dir.root().display().to_string(),
                "resources": resources,
            })
        );
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Resources: {}", rows.len());
        for (r, index, documents, pending) in &rows {
            let index = index.as_deref().unwrap_or("(not built)");
            let documents = documents.map_or("-".to_string(), |n| n.to_string());
            println!(
                "  {}: {} -> {index}, {documents} documents, {pending} pending batch(es)",
                r.id, r.alias
            );
        }
    }
    Ok(())
}
