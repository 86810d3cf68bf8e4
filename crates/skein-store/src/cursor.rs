//! Raw per-object event streams handed to the query pipeline
//!
//! Queries do not decode events into `Event` maps; the mapper consumes the
//! raw encoded bodies and decodes straight into its slot layout. The shard
//! scan groups rows by object and yields them through these types while the
//! read transaction stays open.

/// One encoded event: its timestamp (from the key) and the stored body.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub timestamp: i64,
    pub body: Vec<u8>,
}

/// Every event of one object, in ascending timestamp order.
#[derive(Debug, Clone)]
pub struct ObjectEvents {
    pub object: String,
    pub events: Vec<RawEvent>,
}
