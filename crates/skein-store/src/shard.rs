//! Shard: one transactional environment holding a disjoint subset of objects
//!
//! A shard owns a single memory-mapped redb database under
//! `<data-path>/data/<index>/`. Each Skein table maps to one redb table whose
//! rows are `(object-key ‖ timestamp) → event-body`. Write transactions are
//! serialized per shard by the engine; read transactions run concurrently
//! with each other and with one writer.

use crate::codec;
use crate::cursor::{ObjectEvents, RawEvent};
use crate::error::Result;
use redb::{Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition, TableHandle};
use skein_core::Event;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SHARD_FILE: &str = "shard.redb";

/// Environment knobs, loaded from config. `max_dbs` and `max_readers` are
/// kept for configuration compatibility with the classic environment layout;
/// redb sizes its reader state internally, so only `nosync` changes engine
/// behavior.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    pub nosync: bool,
    pub max_dbs: u32,
    pub max_readers: u32,
}

impl Default for EnvOptions {
    fn default() -> Self {
        EnvOptions {
            nosync: false,
            max_dbs: 4096,
            max_readers: 126,
        }
    }
}

fn table_def(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Per-shard counters reported by `stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShardStats {
    pub index: usize,
    /// Event count per table.
    pub tables: BTreeMap<String, u64>,
}

pub struct Shard {
    index: usize,
    path: PathBuf,
    db: Database,
    opts: EnvOptions,
}

impl Shard {
    /// Opens (creating if needed) the shard rooted at `<data-path>/data/<index>/`.
    pub fn open(path: impl AsRef<Path>, index: usize, opts: EnvOptions) -> Result<Shard> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let db = Database::create(path.join(SHARD_FILE))?;
        Ok(Shard {
            index,
            path,
            db,
            opts,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_write(&self) -> Result<redb::WriteTransaction> {
        let mut txn = self.db.begin_write()?;
        if self.opts.nosync {
            txn.set_durability(Durability::None);
        }
        Ok(txn)
    }

    /// Inserts or replaces one event.
    pub fn insert_event(&self, table: &str, object: &str, event: &Event) -> Result<()> {
        self.insert_events(table, object, std::slice::from_ref(event))
    }

    /// Inserts a batch of events for one object. The whole batch shares one
    /// transaction: all or nothing.
    pub fn insert_events(&self, table: &str, object: &str, events: &[Event]) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut t = txn.open_table(table_def(table))?;
            for event in events {
                let key = codec::object_key(object, event.timestamp);
                let body = codec::encode_event(event);
                t.insert(key.as_slice(), body.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Inserts events for many objects under a single transaction. Returns
    /// the number of events written.
    pub fn insert_objects(&self, table: &str, objects: &BTreeMap<String, Vec<Event>>) -> Result<usize> {
        let mut count = 0;
        let txn = self.begin_write()?;
        {
            let mut t = txn.open_table(table_def(table))?;
            for (object, events) in objects {
                for event in events {
                    let key = codec::object_key(object, event.timestamp);
                    let body = codec::encode_event(event);
                    t.insert(key.as_slice(), body.as_slice())?;
                    count += 1;
                }
            }
        }
        txn.commit()?;
        Ok(count)
    }

    /// Point lookup of one event.
    pub fn get_event(&self, table: &str, object: &str, timestamp: i64) -> Result<Option<Event>> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table_def(table)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = codec::object_key(object, timestamp);
        match t.get(key.as_slice())? {
            Some(guard) => Ok(Some(codec::decode_event(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All events of one object in ascending timestamp order.
    pub fn get_events(&self, table: &str, object: &str) -> Result<Vec<Event>> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table_def(table)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = codec::object_prefix(object);
        let mut events = Vec::new();
        for item in range_from(&t, &prefix)? {
            let (key, value) = item?;
            if !key.value().starts_with(prefix.as_slice()) {
                break;
            }
            events.push(codec::decode_event(value.value())?);
        }
        Ok(events)
    }

    /// Deletes one event. Deleting a missing event is a no-op.
    pub fn delete_event(&self, table: &str, object: &str, timestamp: i64) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut t = txn.open_table(table_def(table))?;
            let key = codec::object_key(object, timestamp);
            t.remove(key.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Deletes every event of one object.
    pub fn delete_object(&self, table: &str, object: &str) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut t = txn.open_table(table_def(table))?;
            let prefix = codec::object_prefix(object);
            let keys = collect_prefix_keys(&t, &prefix)?;
            for key in keys {
                t.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Removes the whole table from this shard.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        let txn = self.begin_write()?;
        match txn.delete_table(table_def(table)) {
            Ok(_) => {}
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }

    /// Folds `src`'s events into `dst` and deletes `src`, all within one
    /// transaction: a crash leaves either the pre-state or the merged state.
    /// On a timestamp collision the destination's event is retained.
    pub fn merge(&self, table: &str, dst: &str, src: &str) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut t = txn.open_table(table_def(table))?;

            let src_prefix = codec::object_prefix(src);
            let src_rows: Vec<(Vec<u8>, Vec<u8>)> = {
                let mut rows = Vec::new();
                for item in range_from(&t, &src_prefix)? {
                    let (key, value) = item?;
                    if !key.value().starts_with(src_prefix.as_slice()) {
                        break;
                    }
                    rows.push((key.value().to_vec(), value.value().to_vec()));
                }
                rows
            };

            let dst_prefix = codec::object_prefix(dst);
            let dst_timestamps: std::collections::BTreeSet<i64> = {
                let mut set = std::collections::BTreeSet::new();
                for item in range_from(&t, &dst_prefix)? {
                    let (key, _) = item?;
                    if !key.value().starts_with(dst_prefix.as_slice()) {
                        break;
                    }
                    let (_, timestamp) = codec::decode_key(key.value())?;
                    set.insert(timestamp);
                }
                set
            };

            for (key, body) in &src_rows {
                let (_, timestamp) = codec::decode_key(key)?;
                if !dst_timestamps.contains(&timestamp) {
                    let dst_key = codec::object_key(dst, timestamp);
                    t.insert(dst_key.as_slice(), body.as_slice())?;
                }
            }
            for (key, _) in &src_rows {
                t.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Streams every object in the table, grouped with its events in
    /// timestamp order, through `f`. The read transaction is held open for
    /// the duration of the scan. A non-empty `prefix` restricts the walk to
    /// objects whose id starts with it.
    pub fn scan_objects(
        &self,
        table: &str,
        prefix: &str,
        mut f: impl FnMut(ObjectEvents) -> Result<()>,
    ) -> Result<()> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table_def(table)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut current: Option<ObjectEvents> = None;
        for item in t.range::<&[u8]>(..)? {
            let (key, value) = item?;
            let (object, timestamp) = codec::decode_key(key.value())?;
            if !prefix.is_empty() && !object.starts_with(prefix) {
                continue;
            }
            let raw = RawEvent {
                timestamp,
                body: value.value().to_vec(),
            };
            match &mut current {
                Some(group) if group.object == object => group.events.push(raw),
                _ => {
                    if let Some(done) = current.take() {
                        f(done)?;
                    }
                    current = Some(ObjectEvents {
                        object,
                        events: vec![raw],
                    });
                }
            }
        }
        if let Some(done) = current {
            f(done)?;
        }
        Ok(())
    }

    /// Distinct object ids in the table, in key order.
    pub fn object_ids(&self, table: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        self.scan_objects(table, "", |group| {
            ids.push(group.object);
            Ok(())
        })?;
        Ok(ids)
    }

    /// Per-table event counts.
    pub fn stats(&self) -> Result<ShardStats> {
        let txn = self.db.begin_read()?;
        let mut stats = ShardStats {
            index: self.index,
            tables: BTreeMap::new(),
        };
        for handle in txn.list_tables()? {
            let name = handle.name().to_string();
            let t = txn.open_table(table_def(&name))?;
            stats.tables.insert(name, t.len()?);
        }
        Ok(stats)
    }
}

fn range_from<'a, T>(
    table: &'a T,
    prefix: &'a [u8],
) -> Result<redb::Range<'a, &'static [u8], &'static [u8]>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table.range::<&[u8]>(prefix..)?)
}

fn collect_prefix_keys<'a, T>(table: &'a T, prefix: &'a [u8]) -> Result<Vec<Vec<u8>>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut keys = Vec::new();
    for item in range_from(table, prefix)? {
        let (key, _) = item?;
        if !key.value().starts_with(prefix) {
            break;
        }
        keys.push(key.value().to_vec());
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Value;
    use tempfile::TempDir;

    fn open_shard(dir: &TempDir) -> Shard {
        Shard::open(dir.path(), 0, EnvOptions::default()).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let event = Event::new(1_000).with_field(1, "john");
        shard.insert_event("foo", "bar", &event).unwrap();

        let got = shard.get_event("foo", "bar", 1_000).unwrap().unwrap();
        assert_eq!(got, event);
        assert!(shard.get_event("foo", "bar", 2_000).unwrap().is_none());
        assert!(shard.get_event("ghost", "bar", 1_000).unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_inserts_read_sorted() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        for ts in [2_000, 1_000, 3_000] {
            shard
                .insert_event("foo", "bar", &Event::new(ts).with_field(1, ts))
                .unwrap();
        }
        let events = shard.get_events("foo", "bar").unwrap();
        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn test_object_isolation_with_shared_byte_prefix() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(1).with_field(1, 1i64))
            .unwrap();
        shard
            .insert_event("foo", "barx", &Event::new(2).with_field(1, 2i64))
            .unwrap();

        let events = shard.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 1);
    }

    #[test]
    fn test_replace_on_same_timestamp() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(5).with_field(1, "a"))
            .unwrap();
        shard
            .insert_event("foo", "bar", &Event::new(5).with_field(1, "b"))
            .unwrap();
        let events = shard.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get(1), Some(&Value::Str("b".into())));
    }

    #[test]
    fn test_delete_event_and_object() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(1).with_field(1, "a"))
            .unwrap();
        shard
            .insert_event("foo", "bar", &Event::new(2).with_field(1, "b"))
            .unwrap();

        shard.delete_event("foo", "bar", 1).unwrap();
        assert_eq!(shard.get_events("foo", "bar").unwrap().len(), 1);

        // deleting a missing event is a no-op
        shard.delete_event("foo", "bar", 99).unwrap();
        assert_eq!(shard.get_events("foo", "bar").unwrap().len(), 1);

        shard.delete_object("foo", "bar").unwrap();
        assert!(shard.get_events("foo", "bar").unwrap().is_empty());
    }

    #[test]
    fn test_merge_destination_wins_ties() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(2).with_field(1, "jane"))
            .unwrap();
        shard
            .insert_event("foo", "bar", &Event::new(3).with_field(1, "john"))
            .unwrap();
        shard
            .insert_event("foo", "bat", &Event::new(1).with_field(1, "jose"))
            .unwrap();
        shard
            .insert_event("foo", "bat", &Event::new(2).with_field(1, "joe"))
            .unwrap();

        shard.merge("foo", "bar", "bat").unwrap();

        let events = shard.get_events("foo", "bar").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, 1);
        assert_eq!(events[0].get(1), Some(&Value::Str("jose".into())));
        assert_eq!(events[1].timestamp, 2);
        assert_eq!(events[1].get(1), Some(&Value::Str("jane".into())));
        assert_eq!(events[2].timestamp, 3);
        assert_eq!(events[2].get(1), Some(&Value::Str("john".into())));

        assert!(shard.get_events("foo", "bat").unwrap().is_empty());
    }

    #[test]
    fn test_drop_table() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(1).with_field(1, "a"))
            .unwrap();
        shard.drop_table("foo").unwrap();
        assert!(shard.get_events("foo", "bar").unwrap().is_empty());
        // dropping twice is fine
        shard.drop_table("foo").unwrap();
    }

    #[test]
    fn test_scan_objects_groups_and_orders() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(2).with_field(1, 1i64))
            .unwrap();
        shard
            .insert_event("foo", "bar", &Event::new(1).with_field(1, 2i64))
            .unwrap();
        shard
            .insert_event("foo", "baz", &Event::new(1).with_field(1, 3i64))
            .unwrap();

        let mut seen = Vec::new();
        shard
            .scan_objects("foo", "", |group| {
                let timestamps: Vec<i64> = group.events.iter().map(|e| e.timestamp).collect();
                seen.push((group.object, timestamps));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("bar".to_string(), vec![1, 2]),
                ("baz".to_string(), vec![1]),
            ]
        );
    }

    #[test]
    fn test_scan_objects_prefix_filter() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        for object in ["u:1", "u:2", "s:1"] {
            shard
                .insert_event("foo", object, &Event::new(1).with_field(1, 1i64))
                .unwrap();
        }
        assert_eq!(shard.object_ids("foo").unwrap().len(), 3);

        let mut seen = Vec::new();
        shard
            .scan_objects("foo", "u:", |group| {
                seen.push(group.object);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["u:1".to_string(), "u:2".to_string()]);
    }

    #[test]
    fn test_stats_counts_events() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard
            .insert_event("foo", "bar", &Event::new(1).with_field(1, 1i64))
            .unwrap();
        shard
            .insert_event("foo", "bar", &Event::new(2).with_field(1, 1i64))
            .unwrap();
        let stats = shard.stats().unwrap();
        assert_eq!(stats.tables.get("foo"), Some(&2));
    }
}
