//! Skein Query - the compiled query pipeline
//!
//! A query is validated, lowered to a fully-resolved program (the mapper),
//! executed against every shard in parallel over raw event bytes, and the
//! per-shard result maps are folded by the reducer into one nested response.

pub mod error;
pub mod executor;
pub mod hashmap;
pub mod ir;
pub mod mapper;
pub mod reducer;

pub use error::{QueryError, Result};
pub use executor::{execute, MapperCache};
pub use hashmap::{Acc, ResultMap};
pub use ir::QueryProgram;
pub use mapper::Mapper;
