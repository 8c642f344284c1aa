//! Source event log.
//!
//! Producers append change events in batches; each batch is one JSON-lines
//! file at `<root>/<resource>/<producer>/<batch>.jsonl`. A batch is retired
//! (its file deleted) only once every write derived from it is committed,
//! so whatever is still on disk is exactly what remains to be processed.

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    model::{ChangeEvent, SourceRef},
};

const BATCH_EXTENSION: &str = "jsonl";

/// Events loaded from one producer batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub source: SourceRef,
    pub events: Vec<ChangeEvent>,
    /// Lines that could not be parsed and were skipped.
    pub dropped: usize,
}

pub trait EventLog: Send + Sync {
    /// Pending batches for a resource, oldest first.
    fn pending(&self, resource_id: &str) -> Result<Vec<SourceRef>>;

    fn load(&self, source: &SourceRef) -> Result<EventBatch>;

    /// Permanently discard a batch.
    fn retire(&self, source: &SourceRef) -> Result<()>;
}

/// Directory-backed event log.
#[derive(Debug)]
pub struct DirEventLog {
    root: PathBuf,
    sequence: AtomicU64,
}

impl DirEventLog {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            sequence: AtomicU64::new(0),
        })
    }

    fn batch_path(&self, source: &SourceRef) -> Result<PathBuf> {
        for part in [&source.resource_id, &source.producer, &source.batch] {
            check_component(part)?;
        }
        Ok(self
            .root
            .join(&source.resource_id)
            .join(&source.producer)
            .join(format!("{}.{BATCH_EXTENSION}", source.batch)))
    }

    /// Write a new batch for `producer`. Returns its reference.
    pub fn append(
        &self,
        resource_id: &str,
        producer: &str,
        events: &[ChangeEvent],
    ) -> Result<SourceRef> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let source = SourceRef {
            resource_id: resource_id.to_string(),
            producer: producer.to_string(),
            batch: format!("{nanos:024}-{seq:06}"),
        };

        let path = self.batch_path(&source)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename, so readers never see a partial batch.
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for event in events {
                serde_json::to_writer(&mut file, event)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(batch = %source, events = events.len(), "appended event batch");
        Ok(source)
    }
}

impl EventLog for DirEventLog {
    fn pending(&self, resource_id: &str) -> Result<Vec<SourceRef>> {
        check_component(resource_id)?;
        let dir = self.root.join(resource_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut sources = Vec::new();
        for producer in fs::read_dir(&dir)? {
            let producer = producer?;
            if !producer.file_type()?.is_dir() {
                continue;
            }
            let producer_name = producer.file_name().to_string_lossy().to_string();
            for batch in fs::read_dir(producer.path())? {
                let path = batch?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXTENSION) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                sources.push(SourceRef {
                    resource_id: resource_id.to_string(),
                    producer: producer_name.clone(),
                    batch: stem.to_string(),
                });
            }
        }
        sources.sort_by(|a, b| a.batch.cmp(&b.batch).then(a.producer.cmp(&b.producer)));
        Ok(sources)
    }

    fn load(&self, source: &SourceRef) -> Result<EventBatch> {
        let file = fs::File::open(self.batch_path(source)?)?;
        let mut events = Vec::new();
        let mut dropped = 0;

        // Split on raw bytes: a line that is not UTF-8 is one bad record,
        // not a failed batch.
        for (line_no, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice::<ChangeEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    dropped += 1;
                    warn!(
                        batch = %source,
                        line = line_no + 1,
                        error = %e,
                        "dropping malformed event"
                    );
                }
            }
        }

        Ok(EventBatch {
            source: source.clone(),
            events,
            dropped,
        })
    }

    fn retire(&self, source: &SourceRef) -> Result<()> {
        match fs::remove_file(self.batch_path(source)?) {
            Ok(()) => {
                debug!(batch = %source, "retired event batch");
                Ok(())
            }
            // Already retired by an earlier cycle.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn check_component(part: &str) -> Result<()> {
    if part.is_empty()
        || part.starts_with('.')
        || part.contains(['/', '\\'])
    {
        return Err(Error::Config(format!(
            "invalid event log path component: {part:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    fn log() -> (tempfile::TempDir, DirEventLog) {
        let tmp = tempfile::tempdir().unwrap();
        let log = DirEventLog::open(&tmp.path().join("events")).unwrap();
        (tmp, log)
    }

    #[test]
    fn append_load_retire() {
        let (_tmp, log) = log();
        let events = vec![
            ChangeEvent::new(10, EventType::Created, "r", "/f1"),
            ChangeEvent::new(20, EventType::MovedFrom, "r", "/f1"),
        ];
        let source = log.append("r", "agent-1", &events).unwrap();

        assert_eq!(log.pending("r").unwrap(), vec![source.clone()]);
        let batch = log.load(&source).unwrap();
        assert_eq!(batch.events, events);
        assert_eq!(batch.dropped, 0);

        log.retire(&source).unwrap();
        assert!(log.pending("r").unwrap().is_empty());
        // Retiring twice is harmless.
        log.retire(&source).unwrap();
    }

    #[test]
    fn pending_groups_by_producer_in_order() {
        let (_tmp, log) = log();
        let e = [ChangeEvent::new(1, EventType::Created, "r", "/a")];
        let first = log.append("r", "agent-b", &e).unwrap();
        let second = log.append("r", "agent-a", &e).unwrap();
        log.append("other", "agent-a", &e).unwrap();

        assert_eq!(log.pending("r").unwrap(), vec![first, second]);
        assert!(log.pending("missing").unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let (tmp, log) = log();
        let dir = tmp.path().join("events/r/agent");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("0001.jsonl"),
            concat!(
                r#"{"timestamp":1,"type":"CREATED","resource_id":"r","path":"/a"}"#,
                "\nnot json at all\n\n",
                r#"{"timestamp":2,"type":"EXPLODED","resource_id":"r","path":"/b"}"#,
                "\n",
                r#"{"timestamp":3,"type":"DELETED","resource_id":"r","path":"/c"}"#,
                "\n"
            ),
        )
        .unwrap();

        let sources = log.pending("r").unwrap();
        assert_eq!(sources.len(), 1);
        let batch = log.load(&sources[0]).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.dropped, 2);
    }

    #[test]
    fn non_utf8_line_is_dropped_alone() {
        let (tmp, log) = log();
        let dir = tmp.path().join("events/r/agent");
        fs::create_dir_all(&dir).unwrap();
        let mut content = Vec::new();
        content.extend_from_slice(
            br#"{"timestamp":1,"type":"CREATED","resource_id":"r","path":"/a"}"#,
        );
        content.extend_from_slice(b"\n{\"path\":\"/\xff\xfe\"}\r\n");
        content.extend_from_slice(
            br#"{"timestamp":2,"type":"DELETED","resource_id":"r","path":"/b"}"#,
        );
        fs::write(dir.join("0001.jsonl"), content).unwrap();

        let sources = log.pending("r").unwrap();
        let batch = log.load(&sources[0]).unwrap();
        assert_eq!(batch.dropped, 1);
        let paths: Vec<&str> =
            batch.events.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["/a", "/b"]);
    }

    #[test]
    fn rejects_path_traversal() {
        let (_tmp, log) = log();
        assert!(log.pending("../etc").is_err());
        assert!(log.append("r", "a/b", &[]).is_err());
    }
}
