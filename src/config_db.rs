use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    backends::InMemoryBackend,
};

use crate::{error::Result, model::Resource};

const RESOURCES: TableDefinition<&str, &str> = TableDefinition::new("resources");
const ALIASES: TableDefinition<&str, &str> = TableDefinition::new("aliases");
const MAPPINGS: TableDefinition<&str, &str> = TableDefinition::new("mappings");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Registered resources, alias bindings and settings.
///
/// Alias rebinding is a single write transaction, so a reader resolving
/// an alias sees either the previous or the new concrete index.
pub struct ConfigDb {
    db: Database,
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Database::create(path)?)
    }

    /// A throwaway database for tests and embedded use.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(
            Database::builder().create_with_backend(InMemoryBackend::new())?,
        )
    }

    fn init(db: Database) -> Result<Self> {
        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(RESOURCES)?;
        txn.open_table(ALIASES)?;
        txn.open_table(MAPPINGS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Resources --

    pub fn set_resource(&self, resource: &Resource) -> Result<()> {
        let json = serde_json::to_string(resource)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RESOURCES)?;
            table.insert(resource.id.as_str(), json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_resource(&self, id: &str) -> Result<Option<Resource>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RESOURCES)?;
        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn remove_resource(&self, id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(RESOURCES)?;
            table.remove(id)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_resources(&self) -> Result<Vec<Resource>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RESOURCES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_str(v.value())?);
        }
        Ok(result)
    }

    // -- Aliases --

    pub fn set_alias(&self, alias: &str, index: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ALIASES)?;
            table.insert(alias, index)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_alias(&self, alias: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ALIASES)?;
        Ok(table.get(alias)?.map(|v| v.value().to_string()))
    }

    pub fn remove_alias(&self, alias: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(ALIASES)?;
            table.remove(alias)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Drop every alias bound to `index`. Returns the removed aliases.
    pub fn remove_aliases_for(&self, index: &str) -> Result<Vec<String>> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(ALIASES)?;
            let mut bound = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                if v.value() == index {
                    bound.push(k.value().to_string());
                }
            }
            for alias in &bound {
                table.remove(alias.as_str())?;
            }
            bound
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_aliases(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ALIASES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }

    // -- Index mappings --

    pub fn set_mapping(&self, index: &str, mapping: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(MAPPINGS)?;
            table.insert(index, mapping)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_mapping(&self, index: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MAPPINGS)?;
        Ok(table.get(index)?.map(|v| v.value().to_string()))
    }

    pub fn remove_mapping(&self, index: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(MAPPINGS)?;
            table.remove(index)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn resources_crud() {
        let (_tmp, db) = test_db();

        assert!(db.list_resources().unwrap().is_empty());
        assert_eq!(db.get_resource("photos").unwrap(), None);

        let resource = Resource::new("photos", "nfs", "/mnt/photos");
        db.set_resource(&resource).unwrap();
        assert_eq!(db.get_resource("photos").unwrap(), Some(resource));
        assert_eq!(db.list_resources().unwrap().len(), 1);

        assert!(db.remove_resource("photos").unwrap());
        assert!(!db.remove_resource("photos").unwrap());
        assert_eq!(db.get_resource("photos").unwrap(), None);
    }

    #[test]
    fn alias_rebinding_replaces_target() {
        let db = ConfigDb::open_in_memory().unwrap();

        db.set_alias("docsync-a", "docsync-a-old").unwrap();
        db.set_alias("docsync-a", "docsync-a-new").unwrap();
        assert_eq!(
            db.get_alias("docsync-a").unwrap(),
            Some("docsync-a-new".to_string())
        );
        assert_eq!(db.list_aliases().unwrap().len(), 1);

        assert!(db.remove_alias("docsync-a").unwrap());
        assert!(!db.remove_alias("docsync-a").unwrap());
        assert_eq!(db.get_alias("docsync-a").unwrap(), None);
    }

    #[test]
    fn remove_aliases_for_index() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.set_alias("one", "idx").unwrap();
        db.set_alias("two", "idx").unwrap();
        db.set_alias("three", "other").unwrap();

        let mut removed = db.remove_aliases_for("idx").unwrap();
        removed.sort();
        assert_eq!(removed, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(db.get_alias("three").unwrap(), Some("other".to_string()));
    }

    #[test]
    fn mappings_crud() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.set_mapping("idx", "{}").unwrap();
        assert_eq!(db.get_mapping("idx").unwrap(), Some("{}".to_string()));
        assert!(db.remove_mapping("idx").unwrap());
        assert_eq!(db.get_mapping("idx").unwrap(), None);
    }

    #[test]
    fn settings_crud() {
        let (_tmp, db) = test_db();

        assert_eq!(db.get_setting("batch.max_docs").unwrap(), None);
        assert_eq!(
            db.get_setting_or("batch.max_docs", "1000").unwrap(),
            "1000"
        );

        db.set_setting("batch.max_docs", "50").unwrap();
        assert_eq!(
            db.get_setting_or("batch.max_docs", "1000").unwrap(),
            "50"
        );
        assert_eq!(db.list_settings().unwrap().len(), 1);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.redb");

        {
            let db = ConfigDb::open(&path).unwrap();
            db.set_resource(&Resource::new("a", "nfs", "/mnt/a")).unwrap();
            db.set_alias("docsync-a", "docsync-a-x1").unwrap();
        }

        {
            let db = ConfigDb::open(&path).unwrap();
            assert!(db.get_resource("a").unwrap().is_some());
            assert_eq!(
                db.get_alias("docsync-a").unwrap(),
                Some("docsync-a-x1".to_string())
            );
        }
    }
}
