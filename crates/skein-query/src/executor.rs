//! Query coordinator
//!
//! Compiles a query once, fans it out to every shard in parallel, then folds
//! the per-shard result maps through the reducer. Each shard task holds its
//! own read transaction for the duration of its scan and fills its own
//! result map; there is no shared mutable state between tasks. The deadline
//! is checked before each shard dispatch; mid-scan cancellation is not
//! supported.

use crate::error::{QueryError, Result};
use crate::hashmap::ResultMap;
use crate::mapper::Mapper;
use crate::reducer;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use skein_core::{Query, Table};
use skein_store::Store;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_CACHE_CAPACITY: usize = 64;

/// LRU cache of compiled mappers keyed by query fingerprint.
pub struct MapperCache {
    capacity: usize,
    entries: Mutex<IndexMap<String, Arc<Mapper>>>,
}

impl Default for MapperCache {
    fn default() -> Self {
        MapperCache::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl MapperCache {
    pub fn new(capacity: usize) -> Self {
        MapperCache {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Returns a compiled mapper for the query, compiling on miss. The
    /// fingerprint covers the query and the schema snapshot it was compiled
    /// against, so a property addition invalidates naturally.
    pub fn get_or_compile(
        &self,
        store: &Store,
        table: &Table,
        query: &Query,
    ) -> Result<Arc<Mapper>> {
        let fingerprint = fingerprint(table, query)?;

        {
            let mut entries = self.entries.lock();
            if let Some(mapper) = entries.shift_remove(&fingerprint) {
                // re-insert at the hot end
                entries.insert(fingerprint, mapper.clone());
                return Ok(mapper);
            }
        }

        let mapper = Arc::new(Mapper::new(query, table, store)?);
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(fingerprint, mapper.clone());
        Ok(mapper)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fingerprint(table: &Table, query: &Query) -> Result<String> {
    let query_json =
        serde_json::to_string(query).map_err(|e| QueryError::Codegen(e.to_string()))?;
    let schema_json =
        serde_json::to_string(table).map_err(|e| QueryError::Codegen(e.to_string()))?;
    Ok(format!("{}@{}", schema_json, query_json))
}

/// Runs a compiled mapper against every shard in parallel and reduces the
/// results. Any shard failure fails the whole query.
pub fn execute_mapper(
    store: &Store,
    mapper: &Mapper,
    deadline: Option<Instant>,
) -> Result<serde_json::Value> {
    let program = mapper.program();
    let started = Instant::now();

    let maps: Vec<ResultMap> = (0..store.shard_count())
        .into_par_iter()
        .map(|index| -> Result<ResultMap> {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(QueryError::DeadlineExceeded);
                }
            }
            let mut results = ResultMap::new();
            store.scan_shard(index, &program.table_name, &program.prefix, |object| {
                mapper
                    .map(&object, &mut results)
                    .map_err(|e| match e {
                        QueryError::Store(inner) => inner,
                        other => skein_store::StoreError::InvalidArgument(other.to_string()),
                    })
            })?;
            Ok(results)
        })
        .collect::<Result<Vec<_>>>()?;

    let reduced = reducer::reduce(store, program, &maps)?;
    debug!(
        table = %program.table_name,
        shards = maps.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "query executed"
    );
    Ok(reduced)
}

/// Compile-and-run convenience used by the HTTP surface.
pub fn execute(
    store: &Store,
    cache: &MapperCache,
    table: &Table,
    query: &Query,
    deadline: Option<Instant>,
) -> Result<serde_json::Value> {
    let mapper = cache.get_or_compile(store, table, query)?;
    execute_mapper(store, &mapper, deadline)
}
