//! Bulk document batcher.
//!
//! Buffers write operations and flushes them to a [`DocumentSender`] when
//! either the document-count or the byte limit is reached. Source event
//! batches are acknowledged per flush, and only when the whole flush went
//! through without a single failed item.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::{
    engine::DocumentSender,
    error::Result,
    model::{SourceRef, WriteOp},
};

/// Lower bound on ops per `send_bulk` call.
pub const MIN_PARTITION: usize = 100;
/// Upper bound on ops per `send_bulk` call.
pub const MAX_PARTITION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_docs: usize,
    pub max_bytes: usize,
}

impl BatchLimits {
    /// `max_mb` is in mebibytes.
    pub fn new(max_docs: usize, max_mb: usize) -> Self {
        Self {
            max_docs: max_docs.max(1),
            max_bytes: max_mb << 20,
        }
    }

    /// Ops per request, independent of the flush threshold.
    pub fn partition_size(&self) -> usize {
        self.max_docs.clamp(MIN_PARTITION, MAX_PARTITION)
    }
}

/// A buffered op with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub op: WriteOp,
    pub object_type: String,
    pub source: Option<SourceRef>,
}

impl BatchItem {
    pub fn new(op: WriteOp, object_type: &str) -> Self {
        Self {
            op,
            object_type: object_type.to_string(),
            source: None,
        }
    }

    pub fn from_source(op: WriteOp, object_type: &str, source: SourceRef) -> Self {
        Self {
            source: Some(source),
            ..Self::new(op, object_type)
        }
    }
}

/// Called after a fully successful flush, once per object type present in
/// it, with the source batches that flush covered.
pub trait PostFlushHook: Send + Sync {
    fn retire(&self, object_type: &str, sources: &[SourceRef]) -> Result<()>;
}

/// Accumulated outcome of every flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushes: usize,
    pub sent: usize,
    pub failed: usize,
    /// Sources that were part of a flush with at least one failure.
    pub failed_sources: BTreeSet<SourceRef>,
    /// Sources the hook acknowledged.
    pub retired_sources: BTreeSet<SourceRef>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct Batcher<'a> {
    sender: &'a dyn DocumentSender,
    hook: Option<&'a dyn PostFlushHook>,
    limits: BatchLimits,
    buffer: Vec<BatchItem>,
    buffered_bytes: usize,
    report: FlushReport,
}

impl<'a> Batcher<'a> {
    pub fn new(sender: &'a dyn DocumentSender, limits: BatchLimits) -> Self {
        Self {
            sender,
            hook: None,
            limits,
            buffer: Vec::new(),
            buffered_bytes: 0,
            report: FlushReport::default(),
        }
    }

    pub fn with_hook(mut self, hook: &'a dyn PostFlushHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Buffer an item, flushing first if the buffer is already at a limit.
    pub fn add(&mut self, item: BatchItem) {
        if self.buffer.len() >= self.limits.max_docs
            || (!self.buffer.is_empty()
                && self.buffered_bytes >= self.limits.max_bytes)
        {
            self.flush();
        }
        self.buffered_bytes += item.op.byte_size();
        self.buffer.push(item);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Send everything buffered. The buffer is empty afterwards whatever
    /// the outcome; failed items are not retried here.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;
        self.report.flushes += 1;

        let mut failed = 0;
        for chunk in items.chunks(self.limits.partition_size()) {
            failed += self.send_partition(chunk);
        }
        self.report.sent += items.len();
        self.report.failed += failed;

        let sources = items.iter().filter_map(|item| item.source.clone());
        if failed > 0 {
            warn!(
                items = items.len(),
                failed, "flush had failures, nothing retired"
            );
            self.report.failed_sources.extend(sources);
            return;
        }
        debug!(items = items.len(), "flush complete");

        let Some(hook) = self.hook else {
            return;
        };
        let mut by_type: BTreeMap<&str, BTreeSet<SourceRef>> = BTreeMap::new();
        for item in &items {
            let entry = by_type.entry(item.object_type.as_str()).or_default();
            if let Some(source) = &item.source {
                entry.insert(source.clone());
            }
        }
        for (object_type, sources) in by_type {
            let sources: Vec<SourceRef> = sources.into_iter().collect();
            match hook.retire(object_type, &sources) {
                Ok(()) => self.report.retired_sources.extend(sources),
                Err(e) => {
                    warn!(object_type, error = %e, "post-flush hook failed")
                }
            }
        }
    }

    /// Returns the number of failed items in the partition.
    fn send_partition(&self, chunk: &[BatchItem]) -> usize {
        // One request per target, preserving op order within each target.
        let mut groups: Vec<(&str, Vec<WriteOp>)> = Vec::new();
        for item in chunk {
            let target = item.op.target();
            match groups.iter_mut().find(|(t, _)| *t == target) {
                Some((_, ops)) => ops.push(item.op.clone()),
                None => groups.push((target, vec![item.op.clone()])),
            }
        }

        let mut failed = 0;
        for (target, ops) in groups {
            match self.sender.send_bulk(target, &ops) {
                Ok(outcomes) => {
                    for outcome in outcomes.iter().filter(|o| o.failed) {
                        warn!(
                            index = target,
                            doc_id = %outcome.doc_id,
                            message = outcome.message.as_deref().unwrap_or(""),
                            "bulk item failed"
                        );
                    }
                    let item_failures =
                        outcomes.iter().filter(|o| o.failed).count();
                    // Items the sender did not report on count as failed.
                    failed += item_failures
                        + ops.len().saturating_sub(outcomes.len());
                }
                Err(e) => {
                    warn!(index = target, error = %e, "bulk request failed");
                    failed += ops.len();
                }
            }
        }
        failed
    }

    /// Flush the remainder and return the accumulated report.
    pub fn finish(mut self) -> FlushReport {
        self.flush();
        std::mem::take(&mut self.report)
    }
}

impl Drop for Batcher<'_> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            debug!(items = self.buffer.len(), "flushing batcher on drop");
            self.flush();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use serde_json::{Map, Value};

    use super::*;
    use crate::model::ItemOutcome;

    /// Records every request; fails items whose doc id starts with `bad`.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub calls: Mutex<Vec<(String, Vec<WriteOp>)>>,
    }

    impl RecordingSender {
        pub fn call_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(|(_, ops)| ops.len()).collect()
        }
    }

    impl DocumentSender for RecordingSender {
        fn send_bulk(
            &self,
            index: &str,
            ops: &[WriteOp],
        ) -> Result<Vec<ItemOutcome>> {
            self.calls
                .lock()
                .unwrap()
                .push((index.to_string(), ops.to_vec()));
            Ok(ops
                .iter()
                .map(|op| {
                    if op.doc_id().starts_with("bad") {
                        ItemOutcome::failed(op.doc_id(), "rejected")
                    } else {
                        ItemOutcome::ok(op.doc_id())
                    }
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, Vec<SourceRef>)>>,
    }

    impl PostFlushHook for RecordingHook {
        fn retire(&self, object_type: &str, sources: &[SourceRef]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((object_type.to_string(), sources.to_vec()));
            Ok(())
        }
    }

    fn source(batch: &str) -> SourceRef {
        SourceRef {
            resource_id: "r".into(),
            producer: "p".into(),
            batch: batch.into(),
        }
    }

    fn op(doc_id: &str) -> WriteOp {
        let mut fields = Map::new();
        fields.insert("path".into(), Value::from(format!("/{doc_id}")));
        WriteOp::index("idx", doc_id, fields)
    }

    fn item(doc_id: &str, batch: &str) -> BatchItem {
        BatchItem::from_source(op(doc_id), "files", source(batch))
    }

    #[test]
    fn limit_plus_one_flushes_exactly_limit() {
        let sender = RecordingSender::default();
        let mut batcher = Batcher::new(&sender, BatchLimits::new(3, 10));

        for i in 0..3 {
            batcher.add(item(&format!("d{i}"), "b1"));
        }
        assert!(sender.call_sizes().is_empty());

        batcher.add(item("d3", "b1"));
        assert_eq!(sender.call_sizes(), vec![3]);
        assert_eq!(batcher.buffered(), 1);

        let report = batcher.finish();
        assert_eq!(sender.call_sizes(), vec![3, 1]);
        assert_eq!(report.flushes, 2);
        assert_eq!(report.sent, 4);
        assert!(report.is_clean());
    }

    #[test]
    fn byte_limit_triggers_flush() {
        let sender = RecordingSender::default();
        let mut limits = BatchLimits::new(1000, 1);
        limits.max_bytes = op("d0").byte_size() * 2;
        let mut batcher = Batcher::new(&sender, limits);

        batcher.add(item("d0", "b"));
        batcher.add(item("d1", "b"));
        assert!(sender.call_sizes().is_empty());
        // Buffer now sits at the limit, so the next add flushes first.
        batcher.add(item("d2", "b"));
        assert_eq!(sender.call_sizes(), vec![2]);
        drop(batcher);
        assert_eq!(sender.call_sizes(), vec![2, 1]);
    }

    #[test]
    fn deletes_do_not_count_toward_bytes() {
        let sender = RecordingSender::default();
        let mut limits = BatchLimits::new(1000, 1);
        limits.max_bytes = 1;
        let mut batcher = Batcher::new(&sender, limits);
        for i in 0..5 {
            batcher.add(BatchItem::new(WriteOp::delete("idx", format!("d{i}")), "files"));
        }
        assert_eq!(batcher.buffered(), 5);
        assert!(sender.call_sizes().is_empty());
    }

    #[test]
    fn partition_size_is_clamped() {
        assert_eq!(BatchLimits::new(3, 1).partition_size(), MIN_PARTITION);
        assert_eq!(BatchLimits::new(500, 1).partition_size(), 500);
        assert_eq!(BatchLimits::new(50_000, 1).partition_size(), MAX_PARTITION);
        assert_eq!(BatchLimits::new(0, 1).max_docs, 1);
    }

    #[test]
    fn large_flush_is_partitioned() {
        let sender = RecordingSender::default();
        let mut batcher = Batcher::new(&sender, BatchLimits::new(2500, 100));
        for i in 0..2500 {
            batcher.add(BatchItem::new(op(&format!("d{i}")), "files"));
        }
        batcher.finish();
        assert_eq!(sender.call_sizes(), vec![1000, 1000, 500]);
    }

    #[test]
    fn clean_flush_retires_once_per_object_type() {
        let sender = RecordingSender::default();
        let hook = RecordingHook::default();
        let mut batcher =
            Batcher::new(&sender, BatchLimits::new(10, 10)).with_hook(&hook);

        batcher.add(item("a", "b1"));
        batcher.add(item("b", "b1"));
        batcher.add(BatchItem::from_source(op("c"), "versions", source("b2")));
        let report = batcher.finish();

        let calls = hook.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("files".to_string(), vec![source("b1")]));
        assert_eq!(calls[1], ("versions".to_string(), vec![source("b2")]));
        assert_eq!(report.retired_sources.len(), 2);
    }

    #[test]
    fn failed_item_retires_nothing_in_its_flush() {
        let sender = RecordingSender::default();
        let hook = RecordingHook::default();
        let mut batcher =
            Batcher::new(&sender, BatchLimits::new(2, 10)).with_hook(&hook);

        batcher.add(item("ok1", "b1"));
        batcher.add(item("bad", "b2"));
        // Second flush is clean.
        batcher.add(item("ok2", "b3"));
        let report = batcher.finish();

        assert_eq!(report.failed, 1);
        assert_eq!(
            report.failed_sources,
            BTreeSet::from([source("b1"), source("b2")])
        );
        assert_eq!(report.retired_sources, BTreeSet::from([source("b3")]));
        let calls = hook.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn groups_requests_by_target() {
        let sender = RecordingSender::default();
        let mut batcher = Batcher::new(&sender, BatchLimits::new(10, 10));
        batcher.add(BatchItem::new(op("a"), "files"));
        batcher.add(BatchItem::new(WriteOp::delete("other", "x"), "files"));
        batcher.add(BatchItem::new(WriteOp::delete("idx", "a"), "files"));
        batcher.finish();

        let calls = sender.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "idx");
        assert_eq!(calls[0].1.len(), 2);
        assert!(calls[0].1[1].is_delete());
        assert_eq!(calls[1].0, "other");
    }

    #[test]
    fn drop_flushes_on_early_exit() {
        fn fails_midway(sender: &RecordingSender) -> Result<()> {
            let mut batcher = Batcher::new(sender, BatchLimits::new(10, 10));
            batcher.add(BatchItem::new(op("a"), "files"));
            Err(crate::error::Error::Config("boom".into()))
        }

        let sender = RecordingSender::default();
        assert!(fails_midway(&sender).is_err());
        assert_eq!(sender.call_sizes(), vec![1]);
    }
}
