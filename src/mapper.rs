use serde_json::{Map, Value};

use crate::{
    doc_id::DocumentId,
    model::{FileRecord, Resource, WriteOp},
};

/// Turns a live file into the index operation that represents it.
///
/// Implementations must be pure: the same record always maps to the same
/// operation.
pub trait DocumentMapper: Send + Sync {
    fn doc_id(&self, resource: &Resource, path: &str) -> String {
        DocumentId::new(&resource.id, path).key
    }

    fn map(&self, resource: &Resource, index: &str, record: &FileRecord)
    -> WriteOp;
}

/// Flat JSON document carrying every [`FileRecord`] field.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMapper;

impl DocumentMapper for DefaultMapper {
    fn map(
        &self,
        resource: &Resource,
        index: &str,
        record: &FileRecord,
    ) -> WriteOp {
        let mut source = Map::new();
        source.insert("resource_id".into(), Value::from(resource.id.as_str()));
        source.insert("path".into(), Value::from(record.path.as_str()));
        source.insert("name".into(), Value::from(record.name.as_str()));
        source.insert("size_bytes".into(), Value::from(record.size_bytes));
        source.insert("last_modified".into(), Value::from(record.last_modified));
        if let Some(version) = &record.version {
            source.insert("version".into(), Value::from(version.as_str()));
        }
        source.insert("tags".into(), string_map(&record.tags));
        source.insert("labels".into(), string_map(&record.labels));

        WriteOp::index(index, self.doc_id(resource, &record.path), source)
    }
}

fn string_map(map: &std::collections::BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect(),
    )
}
