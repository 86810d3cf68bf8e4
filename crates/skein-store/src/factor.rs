//! Factor dictionary
//!
//! The factorizer interns high-cardinality strings into dense u64 ids, one
//! id space per `(namespace, property)`. Three key families live in the same
//! table and are kept disjoint by their separator byte:
//!
//! - forward: `hex(len(prop)) ":" prop ">" value` → decimal id
//! - reverse: `hex(len(prop)) ":" prop "<" id` → value
//! - sequence: `hex(len(prop)) ":" prop "!"` → last issued id
//!
//! Id 0 is reserved for the empty string and never persisted. Forward keys
//! are truncated to the key-size budget, so two sufficiently long values can
//! collapse to one id; callers needing exact fidelity must deduplicate on
//! their side.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use redb::{Database, Durability, ReadableTable, TableDefinition};
use skein_core::{Event, Table, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_KEY_SIZE: usize = 500;
const FACTORS_FILE: &str = "factors.redb";

fn table_def(namespace: &str) -> TableDefinition<'_, &'static str, &'static str> {
    TableDefinition::new(namespace)
}

fn key_overhead(property: &str) -> usize {
    // hex(len) ':' prop '>'
    format!("{:x}:{}>", property.len(), property).len()
}

/// Clamps a value so its forward key fits the key-size budget, respecting
/// char boundaries.
fn truncate_value<'a>(property: &str, value: &'a str) -> &'a str {
    let budget = MAX_KEY_SIZE.saturating_sub(key_overhead(property));
    if value.len() <= budget {
        return value;
    }
    let mut end = budget;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn forward_key(property: &str, value: &str) -> String {
    format!(
        "{:x}:{}>{}",
        property.len(),
        property,
        truncate_value(property, value)
    )
}

fn reverse_key(property: &str, id: u64) -> String {
    format!("{:x}:{}<{}", property.len(), property, id)
}

fn sequence_key(property: &str) -> String {
    format!("{:x}:{}!", property.len(), property)
}

/// Bidirectional `(namespace, property, string) ↔ u64` dictionary backed by
/// one transactional environment.
pub struct Factorizer {
    path: PathBuf,
    nosync: bool,
    db: Option<Database>,
    /// Serializes id allocation; reads go through concurrent read txns.
    alloc: Mutex<()>,
}

impl Factorizer {
    pub fn new(path: impl AsRef<Path>, nosync: bool) -> Self {
        Factorizer {
            path: path.as_ref().to_path_buf(),
            nosync,
            db: None,
            alloc: Mutex::new(()),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        if self.db.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        std::fs::create_dir_all(&self.path)?;
        let db = Database::create(self.path.join(FACTORS_FILE))?;
        self.db = Some(db);
        Ok(())
    }

    pub fn close(&mut self) {
        self.db = None;
    }

    fn db(&self) -> Result<&Database> {
        self.db.as_ref().ok_or(StoreError::NotOpen)
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let txn = self.db()?.begin_read()?;
        let table = match txn.open_table(table_def(namespace)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|guard| guard.value().to_string()))
    }

    /// Converts a value into its id within `(namespace, property)`.
    ///
    /// The empty string is always 0. A missing value is allocated when
    /// `create_if_missing` is set and reported as `FactorNotFound` otherwise.
    pub fn factorize(
        &self,
        namespace: &str,
        property: &str,
        value: &str,
        create_if_missing: bool,
    ) -> Result<u64> {
        if value.is_empty() {
            return Ok(0);
        }

        if let Some(data) = self.get(namespace, &forward_key(property, value))? {
            return parse_id(&data);
        }

        if create_if_missing {
            return self.add(namespace, property, value);
        }

        Err(StoreError::FactorNotFound(forward_key(property, value)))
    }

    /// Allocates an id for a new value. The allocation lock serializes all
    /// writers; the forward key is re-checked under the lock so concurrent
    /// inserts of the same value coalesce onto one id.
    fn add(&self, namespace: &str, property: &str, value: &str) -> Result<u64> {
        let _guard = self.alloc.lock();

        let mut txn = self.db()?.begin_write()?;
        if self.nosync {
            txn.set_durability(Durability::None);
        }
        let id;
        {
            let mut table = txn.open_table(table_def(namespace))?;

            let fkey = forward_key(property, value);
            if let Some(existing) = table.get(fkey.as_str())? {
                return parse_id(existing.value());
            }

            let skey = sequence_key(property);
            let sequence = match table.get(skey.as_str())? {
                Some(data) => parse_id(data.value())?
                    .checked_add(1)
                    .ok_or_else(|| StoreError::Corruption("factor sequence overflow".to_string()))?,
                None => 1,
            };
            table.insert(skey.as_str(), sequence.to_string().as_str())?;

            let truncated = truncate_value(property, value);
            table.insert(fkey.as_str(), sequence.to_string().as_str())?;
            table.insert(reverse_key(property, sequence).as_str(), truncated)?;
            id = sequence;
        }
        txn.commit()?;

        debug!(namespace, property, id, "allocated factor");
        Ok(id)
    }

    /// Converts an id back into its value. Id 0 is the empty string; any
    /// other id without a reverse entry means the dictionary lost a write.
    pub fn defactorize(&self, namespace: &str, property: &str, id: u64) -> Result<String> {
        if id == 0 {
            return Ok(String::new());
        }
        self.get(namespace, &reverse_key(property, id))?
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "factor value does not exist: {}",
                    reverse_key(property, id)
                ))
            })
    }

    /// Replaces string values of factor-typed properties with their ids.
    pub fn factorize_event(
        &self,
        event: &mut Event,
        namespace: &str,
        table: &Table,
        create_if_missing: bool,
    ) -> Result<()> {
        for (property_id, value) in event.data.iter_mut() {
            let Some(property) = table.property(*property_id) else {
                continue;
            };
            if property.data_type != skein_core::DataType::Factor {
                continue;
            }
            if let Value::Str(s) = value {
                let id = self.factorize(namespace, &property.name, s, create_if_missing)?;
                *value = Value::Id(id);
            }
        }
        Ok(())
    }

    pub fn factorize_events(
        &self,
        events: &mut [Event],
        namespace: &str,
        table: &Table,
        create_if_missing: bool,
    ) -> Result<()> {
        for event in events {
            self.factorize_event(event, namespace, table, create_if_missing)?;
        }
        Ok(())
    }

    /// Replaces ids of factor-typed properties with their original strings.
    pub fn defactorize_event(&self, event: &mut Event, namespace: &str, table: &Table) -> Result<()> {
        for (property_id, value) in event.data.iter_mut() {
            let Some(property) = table.property(*property_id) else {
                continue;
            };
            if property.data_type != skein_core::DataType::Factor {
                continue;
            }
            if let Some(id) = value.as_id() {
                *value = Value::Str(self.defactorize(namespace, &property.name, id)?);
            }
        }
        Ok(())
    }

    pub fn defactorize_events(
        &self,
        events: &mut [Event],
        namespace: &str,
        table: &Table,
    ) -> Result<()> {
        for event in events {
            self.defactorize_event(event, namespace, table)?;
        }
        Ok(())
    }

    /// Removes a whole namespace; used when its table is dropped.
    pub fn drop_namespace(&self, namespace: &str) -> Result<()> {
        let txn = self.db()?.begin_write()?;
        match txn.delete_table(table_def(namespace)) {
            Ok(_) => {}
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }
}

fn parse_id(data: &str) -> Result<u64> {
    data.parse::<u64>()
        .map_err(|_| StoreError::Corruption(format!("unable to parse factor sequence: {}", data)))
}
