//! Store facade
//!
//! The store aggregates N shards behind a stable routing function and owns
//! the factor dictionary and the table catalog. Per-object operations touch
//! exactly one shard; fan-out operations visit all of them. Objects are
//! pinned to shards by `xxh3(object) mod shard_count`, so moving an object
//! requires a rebuild, never a rehash.

use crate::cursor::ObjectEvents;
use crate::error::{Result, StoreError};
use crate::factor::Factorizer;
use crate::shard::{EnvOptions, Shard, ShardStats};
use parking_lot::RwLock;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use skein_core::{DataType, Event, Property, Table};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

const DATA_DIR: &str = "data";
const FACTORS_DIR: &str = "factors";
const TABLES_DIR: &str = "tables";

fn valid_table_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

struct Inner {
    path: PathBuf,
    shards: Vec<Shard>,
    factors: Factorizer,
    tables: RwLock<FxHashMap<String, Arc<Table>>>,
}

/// The sharded event store.
pub struct Store {
    opts: EnvOptions,
    inner: Option<Inner>,
}

impl Store {
    pub fn new(opts: EnvOptions) -> Self {
        Store { opts, inner: None }
    }

    /// Opens the store rooted at `path` with `shard_count` shards. A count of
    /// zero reopens an existing store with however many shard directories it
    /// finds, or defaults to the machine's parallelism for a fresh store.
    pub fn open(&mut self, path: impl AsRef<Path>, shard_count: usize) -> Result<()> {
        if self.inner.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        let path = path.as_ref().to_path_buf();
        let data_path = path.join(DATA_DIR);
        std::fs::create_dir_all(&data_path)?;
        std::fs::create_dir_all(path.join(TABLES_DIR))?;

        let mut shard_count = shard_count;
        if shard_count == 0 {
            shard_count = existing_shard_count(&data_path)?;
        }
        if shard_count == 0 {
            shard_count = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }

        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            shards.push(Shard::open(
                data_path.join(index.to_string()),
                index,
                self.opts.clone(),
            )?);
        }

        let mut factors = Factorizer::new(path.join(FACTORS_DIR), self.opts.nosync);
        factors.open()?;

        let tables = load_tables(&path.join(TABLES_DIR))?;

        info!(path = %path.display(), shards = shard_count, "store opened");
        self.inner = Some(Inner {
            path,
            shards,
            factors,
            tables: RwLock::new(tables),
        });
        Ok(())
    }

    /// Closes every shard and the factorizer. Reopening afterwards restores
    /// the pre-close state.
    pub fn close(&mut self) -> Result<()> {
        let mut inner = self.inner.take().ok_or(StoreError::NotOpen)?;
        inner.factors.close();
        inner.shards.clear();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.as_ref().map(|inner| inner.path.as_path())
    }

    fn inner(&self) -> Result<&Inner> {
        self.inner.as_ref().ok_or(StoreError::NotOpen)
    }

    pub fn shard_count(&self) -> usize {
        self.inner.as_ref().map(|i| i.shards.len()).unwrap_or(0)
    }

    /// Shard index owning an object: a pure function of the object id and
    /// the shard count.
    pub fn shard_for(&self, object: &str) -> Result<usize> {
        let inner = self.inner()?;
        Ok((xxh3_64(object.as_bytes()) % inner.shards.len() as u64) as usize)
    }

    fn shard(&self, object: &str) -> Result<&Shard> {
        let inner = self.inner()?;
        Ok(&inner.shards[(xxh3_64(object.as_bytes()) % inner.shards.len() as u64) as usize])
    }

    // ------------------------------------------------------------------
    // Table catalog
    // ------------------------------------------------------------------

    pub fn create_table(&self, name: &str) -> Result<Arc<Table>> {
        if !valid_table_name(name) {
            return Err(StoreError::InvalidArgument(format!(
                "invalid table name: {}",
                name
            )));
        }
        let inner = self.inner()?;
        let mut tables = inner.tables.write();
        if tables.contains_key(name) {
            return Err(StoreError::TableAlreadyExists(name.to_string()));
        }
        let table = Arc::new(Table::new(name));
        persist_table(&inner.path, &table)?;
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    /// Snapshot of a table's schema. The `Arc` is immutable; mutation swaps
    /// in a fresh catalog entry, so queries compiled against this snapshot
    /// are unaffected by later property additions.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        let inner = self.inner()?;
        inner
            .tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        let inner = self.inner()?;
        let mut names: Vec<String> = inner.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Drops a table: catalog entry, schema file, every shard's data, and
    /// the table's factor namespace.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let inner = self.inner()?;
        if inner.tables.write().remove(name).is_none() {
            return Err(StoreError::TableNotFound(name.to_string()));
        }
        let file = inner.path.join(TABLES_DIR).join(format!("{}.json", name));
        if file.exists() {
            std::fs::remove_file(file)?;
        }
        for shard in &inner.shards {
            shard.drop_table(name)?;
        }
        inner.factors.drop_namespace(name)?;
        Ok(())
    }

    /// Adds a property to a table, persisting and swapping the catalog
    /// snapshot.
    pub fn add_property(
        &self,
        table_name: &str,
        name: &str,
        transient: bool,
        data_type: DataType,
    ) -> Result<Property> {
        let inner = self.inner()?;
        let mut tables = inner.tables.write();
        let current = tables
            .get(table_name)
            .ok_or_else(|| StoreError::TableNotFound(table_name.to_string()))?;
        let mut updated = (**current).clone();
        let property = updated.add_property(name, transient, data_type)?;
        let updated = Arc::new(updated);
        persist_table(&inner.path, &updated)?;
        tables.insert(table_name.to_string(), updated);
        Ok(property)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Casts declared fields to their property types and interns factor
    /// strings. Undeclared property ids pass through untouched.
    fn prepare_event(&self, table: &Table, event: &mut Event) -> Result<()> {
        let inner = self.inner()?;
        for (property_id, value) in event.data.iter_mut() {
            if let Some(property) = table.property(*property_id) {
                *value = property.cast(value.clone());
            }
        }
        inner
            .factors
            .factorize_event(event, &table.name, table, true)
    }

    pub fn insert_event(&self, table_name: &str, object: &str, event: Event) -> Result<()> {
        self.insert_events(table_name, object, vec![event])
    }

    /// Inserts a batch of events for one object; the batch is atomic.
    pub fn insert_events(&self, table_name: &str, object: &str, mut events: Vec<Event>) -> Result<()> {
        let table = self.table(table_name)?;
        for event in events.iter_mut() {
            self.prepare_event(&table, event)?;
        }
        self.shard(object)?.insert_events(table_name, object, &events)
    }

    /// Inserts events for many objects. Input is grouped by owning shard and
    /// dispatched concurrently; each shard's batch commits in one
    /// transaction, but the operation is not atomic across shards. Returns
    /// the number of events written.
    pub fn insert_objects(
        &self,
        table_name: &str,
        objects: BTreeMap<String, Vec<Event>>,
    ) -> Result<usize> {
        let table = self.table(table_name)?;
        let inner = self.inner()?;

        let mut grouped: Vec<BTreeMap<String, Vec<Event>>> =
            (0..inner.shards.len()).map(|_| BTreeMap::new()).collect();
        for (object, mut events) in objects {
            for event in events.iter_mut() {
                self.prepare_event(&table, event)?;
            }
            let index = (xxh3_64(object.as_bytes()) % inner.shards.len() as u64) as usize;
            grouped[index].insert(object, events);
        }

        let counts: Result<Vec<usize>> = inner
            .shards
            .par_iter()
            .zip(grouped.par_iter())
            .map(|(shard, batch)| {
                if batch.is_empty() {
                    Ok(0)
                } else {
                    shard.insert_objects(table_name, batch)
                }
            })
            .collect();
        Ok(counts?.into_iter().sum())
    }

    pub fn get_event(&self, table_name: &str, object: &str, timestamp: i64) -> Result<Option<Event>> {
        let table = self.table(table_name)?;
        let inner = self.inner()?;
        match self.shard(object)?.get_event(table_name, object, timestamp)? {
            Some(mut event) => {
                inner
                    .factors
                    .defactorize_event(&mut event, table_name, &table)?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    pub fn get_events(&self, table_name: &str, object: &str) -> Result<Vec<Event>> {
        let table = self.table(table_name)?;
        let inner = self.inner()?;
        let mut events = self.shard(object)?.get_events(table_name, object)?;
        inner
            .factors
            .defactorize_events(&mut events, table_name, &table)?;
        Ok(events)
    }

    pub fn delete_event(&self, table_name: &str, object: &str, timestamp: i64) -> Result<()> {
        self.table(table_name)?;
        self.shard(object)?.delete_event(table_name, object, timestamp)
    }

    pub fn delete_object(&self, table_name: &str, object: &str) -> Result<()> {
        self.table(table_name)?;
        self.shard(object)?.delete_object(table_name, object)
    }

    /// Merges `src`'s events into `dst` (destination wins a timestamp tie)
    /// and deletes `src`. When both objects live on the same shard the whole
    /// merge is one transaction; across shards it is atomic per shard only.
    pub fn merge(&self, table_name: &str, dst: &str, src: &str) -> Result<()> {
        self.table(table_name)?;
        let dst_shard = self.shard(dst)?;
        let src_shard = self.shard(src)?;

        if std::ptr::eq(dst_shard, src_shard) {
            return dst_shard.merge(table_name, dst, src);
        }

        let src_events = src_shard.get_events(table_name, src)?;
        let dst_timestamps: std::collections::BTreeSet<i64> = dst_shard
            .get_events(table_name, dst)?
            .iter()
            .map(|e| e.timestamp)
            .collect();
        let moved: Vec<Event> = src_events
            .into_iter()
            .filter(|e| !dst_timestamps.contains(&e.timestamp))
            .collect();
        dst_shard.insert_events(table_name, dst, &moved)?;
        src_shard.delete_object(table_name, src)
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    pub fn stats(&self) -> Result<Vec<ShardStats>> {
        let inner = self.inner()?;
        inner.shards.iter().map(|s| s.stats()).collect()
    }

    /// Distinct object ids across all shards, sorted.
    pub fn object_ids(&self, table_name: &str) -> Result<Vec<String>> {
        let inner = self.inner()?;
        let mut ids = Vec::new();
        for shard in &inner.shards {
            ids.extend(shard.object_ids(table_name)?);
        }
        ids.sort();
        Ok(ids)
    }

    /// Streams one shard's objects through `f`; the query executor drives
    /// one such scan per shard in parallel.
    pub fn scan_shard(
        &self,
        index: usize,
        table_name: &str,
        prefix: &str,
        f: impl FnMut(ObjectEvents) -> Result<()>,
    ) -> Result<()> {
        let inner = self.inner()?;
        let shard = inner.shards.get(index).ok_or_else(|| {
            StoreError::InvalidArgument(format!("shard index out of range: {}", index))
        })?;
        shard.scan_objects(table_name, prefix, f)
    }

    // ------------------------------------------------------------------
    // Factors (used by the query compiler and reducer)
    // ------------------------------------------------------------------

    pub fn factorize(
        &self,
        namespace: &str,
        property: &str,
        value: &str,
        create_if_missing: bool,
    ) -> Result<u64> {
        self.inner()?
            .factors
            .factorize(namespace, property, value, create_if_missing)
    }

    pub fn defactorize(&self, namespace: &str, property: &str, id: u64) -> Result<String> {
        self.inner()?.factors.defactorize(namespace, property, id)
    }
}

fn existing_shard_count(data_path: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(data_path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir()
            && entry
                .file_name()
                .to_str()
                .map(|s| s.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        {
            count += 1;
        }
    }
    Ok(count)
}

fn persist_table(root: &Path, table: &Table) -> Result<()> {
    let file = root.join(TABLES_DIR).join(format!("{}.json", table.name));
    let json = serde_json::to_string_pretty(table)
        .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
    std::fs::write(file, json)?;
    Ok(())
}

fn load_tables(tables_path: &Path) -> Result<FxHashMap<String, Arc<Table>>> {
    let mut tables = FxHashMap::default();
    for entry in std::fs::read_dir(tables_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let json = std::fs::read_to_string(&path)?;
        let table: Table = serde_json::from_str(&json).map_err(|e| {
            StoreError::Corruption(format!("bad schema file {}: {}", path.display(), e))
        })?;
        tables.insert(table.name.clone(), Arc::new(table));
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, shard_count: usize) -> Store {
        let mut store = Store::new(EnvOptions::default());
        store.open(dir.path(), shard_count).unwrap();
        store
    }

    #[test]
    fn test_open_layout() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);
        assert_eq!(store.shard_count(), 2);
        assert!(dir.path().join("data/0").is_dir());
        assert!(dir.path().join("data/1").is_dir());
        assert!(dir.path().join("factors").is_dir());
    }

    #[test]
    fn test_double_open_fails() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 1);
        assert!(matches!(
            store.open(dir.path(), 1),
            Err(StoreError::AlreadyOpen)
        ));
    }

    #[test]
    fn test_close_then_reopen_keeps_shard_count() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 3);
        store.close().unwrap();
        assert!(!store.is_open());
        store.open(dir.path(), 0).unwrap();
        assert_eq!(store.shard_count(), 3);
    }

    #[test]
    fn test_routing_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4);
        let first = store.shard_for("bar").unwrap();
        for _ in 0..10 {
            assert_eq!(store.shard_for("bar").unwrap(), first);
        }
    }

    #[test]
    fn test_table_catalog() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1);
        store.create_table("foo").unwrap();
        assert!(matches!(
            store.create_table("foo"),
            Err(StoreError::TableAlreadyExists(_))
        ));
        assert!(matches!(
            store.create_table("bad name"),
            Err(StoreError::InvalidArgument(_))
        ));

        let property = store
            .add_property("foo", "name", false, DataType::Factor)
            .unwrap();
        assert_eq!(property.id, 1);

        let table = store.table("foo").unwrap();
        assert_eq!(table.properties.len(), 1);

        store.drop_table("foo").unwrap();
        assert!(matches!(
            store.table("foo"),
            Err(StoreError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_schema_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 1);
        store.create_table("foo").unwrap();
        store
            .add_property("foo", "name", false, DataType::Factor)
            .unwrap();
        store.close().unwrap();

        store.open(dir.path(), 0).unwrap();
        let table = store.table("foo").unwrap();
        assert_eq!(table.property_by_name("name").unwrap().id, 1);
    }

    #[test]
    fn test_insert_objects_counts_and_routes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);
        store.create_table("foo").unwrap();

        let mut objects = BTreeMap::new();
        objects.insert(
            "bar".to_string(),
            vec![
                Event::new(2).with_field(2, 100i64),
                Event::new(0).with_field(1, "john"),
            ],
        );
        objects.insert("bat".to_string(), vec![Event::new(0).with_field(1, "jose")]);

        let n = store.insert_objects("foo", objects).unwrap();
        assert_eq!(n, 3);

        let events = store.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, 0);
        assert_eq!(events[1].timestamp, 2);
        assert_eq!(store.get_events("foo", "bat").unwrap().len(), 1);
    }

    #[test]
    fn test_factor_fields_roundtrip_through_storage() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);
        store.create_table("foo").unwrap();
        store
            .add_property("foo", "name", false, DataType::Factor)
            .unwrap();

        store
            .insert_event("foo", "bar", Event::new(0).with_field(1, "john"))
            .unwrap();
        let event = store.get_event("foo", "bar", 0).unwrap().unwrap();
        assert_eq!(event.get(1), Some(&skein_core::Value::Str("john".into())));
    }

    #[test]
    fn test_not_open_errors() {
        let store = Store::new(EnvOptions::default());
        assert!(matches!(
            store.table("foo"),
            Err(StoreError::NotOpen)
        ));
        assert!(matches!(store.stats(), Err(StoreError::NotOpen)));
    }
}
