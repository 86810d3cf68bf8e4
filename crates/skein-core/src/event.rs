//! Event type
//!
//! An event is a timestamped record attached to an object: a sparse map from
//! property id to value. Timestamps are microseconds since the Unix epoch.

use crate::value::Value;
use std::collections::BTreeMap;

/// A single event in an object's stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    /// Sparse property payload. Absent properties are null; there is no null
    /// value on the wire.
    pub data: BTreeMap<i64, Value>,
}

impl Event {
    pub fn new(timestamp: i64) -> Self {
        Event {
            timestamp,
            data: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, property_id: i64, value: impl Into<Value>) -> Self {
        self.data.insert(property_id, value.into());
        self
    }

    pub fn get(&self, property_id: i64) -> Option<&Value> {
        self.data.get(&property_id)
    }
}
