//! Skein Store - sharded, memory-mapped event storage
//!
//! Events live in per-shard transactional environments keyed by
//! `(object-id, timestamp)`; high-cardinality strings are interned through a
//! side dictionary (the factorizer). This crate is the correctness floor of
//! the system: binary key ordering, shard routing, dictionary atomicity and
//! cross-shard merges all live here.

pub mod codec;
pub mod cursor;
pub mod error;
pub mod factor;
pub mod shard;
pub mod store;

pub use cursor::{ObjectEvents, RawEvent};
pub use error::{Result, StoreError};
pub use factor::Factorizer;
pub use shard::{EnvOptions, Shard, ShardStats};
pub use store::Store;
