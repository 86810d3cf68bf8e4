//! Result hashmap
//!
//! The open-addressed table the compiled query writes aggregates into. One
//! binary layout is shared with the reducer: a length-prefixed packed key
//! (the dimension tuple), a value tag byte, and an 8-byte accumulator. Keys
//! up to 23 bytes are stored inline; longer keys spill to the heap. There
//! are no tombstones because queries never delete.

use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

const INLINE_KEY: usize = 23;
const INITIAL_CAPACITY: usize = 64;

pub const VALUE_TAG_INT: u8 = 1;
pub const VALUE_TAG_FLOAT: u8 = 2;

/// A bucket's accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acc {
    Int(i64),
    Float(f64),
}

impl Acc {
    pub fn tag(&self) -> u8 {
        match self {
            Acc::Int(_) => VALUE_TAG_INT,
            Acc::Float(_) => VALUE_TAG_FLOAT,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    hash: u64,
    key: SmallVec<[u8; INLINE_KEY]>,
    acc: Acc,
}

/// Linear-probing hash table from packed key bytes to an accumulator.
#[derive(Debug)]
pub struct ResultMap {
    buckets: Vec<Option<Bucket>>,
    len: usize,
}

impl Default for ResultMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultMap {
    pub fn new() -> Self {
        ResultMap {
            buckets: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds `delta` to the integer accumulator under `key`, creating the
    /// bucket at zero if absent.
    pub fn add_int(&mut self, key: &[u8], delta: i64) {
        match self.slot_for(key) {
            Ok(index) => {
                let bucket = self.buckets[index].as_mut().unwrap();
                if let Acc::Int(v) = &mut bucket.acc {
                    *v += delta;
                }
            }
            Err(index) => self.insert_at(index, key, Acc::Int(delta)),
        }
    }

    /// Adds `delta` to the float accumulator under `key`.
    pub fn add_float(&mut self, key: &[u8], delta: f64) {
        match self.slot_for(key) {
            Ok(index) => {
                let bucket = self.buckets[index].as_mut().unwrap();
                if let Acc::Float(v) = &mut bucket.acc {
                    *v += delta;
                }
            }
            Err(index) => self.insert_at(index, key, Acc::Float(delta)),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Acc> {
        match self.slot_for(key) {
            Ok(index) => self.buckets[index].as_ref().map(|b| b.acc),
            Err(_) => None,
        }
    }

    /// Walks every occupied bucket. Order is probe order, not insertion
    /// order; the reducer treats buckets as an unordered set.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Acc)> + '_ {
        self.buckets
            .iter()
            .filter_map(|b| b.as_ref().map(|b| (b.key.as_slice(), b.acc)))
    }

    /// Ok(index) when the key occupies that bucket, Err(index) pointing at
    /// the first free probe slot otherwise.
    fn slot_for(&self, key: &[u8]) -> Result<usize, usize> {
        let hash = xxh3_64(key);
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            match &self.buckets[index] {
                Some(bucket) => {
                    if bucket.hash == hash && bucket.key.as_slice() == key {
                        return Ok(index);
                    }
                }
                None => return Err(index),
            }
            index = (index + 1) & mask;
        }
    }

    fn insert_at(&mut self, index: usize, key: &[u8], acc: Acc) {
        self.buckets[index] = Some(Bucket {
            hash: xxh3_64(key),
            key: SmallVec::from_slice(key),
            acc,
        });
        self.len += 1;
        if self.len * 10 >= self.buckets.len() * 7 {
            self.grow();
        }
    }

    fn grow(&mut self) {
        let new_cap = self.buckets.len() * 2;
        let old: Vec<Option<Bucket>> = std::mem::replace(
            &mut self.buckets,
            (0..new_cap).map(|_| None).collect(),
        );
        let mask = new_cap - 1;
        for bucket in old.into_iter().flatten() {
            let mut index = (bucket.hash as usize) & mask;
            while self.buckets[index].is_some() {
                index = (index + 1) & mask;
            }
            self.buckets[index] = Some(bucket);
        }
    }
}
