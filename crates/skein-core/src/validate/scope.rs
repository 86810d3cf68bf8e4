//! Symbol table for query validation.

use crate::schema::DataType;
use rustc_hash::FxHashMap;

/// Information about a resolvable identifier.
#[derive(Debug, Clone, Copy)]
pub struct VarInfo {
    pub data_type: DataType,
}

/// A scope in the chain built while walking the statement tree. Lookups walk
/// outward to the parent.
#[derive(Debug, Default)]
pub struct Symtable<'a> {
    vars: FxHashMap<String, VarInfo>,
    parent: Option<&'a Symtable<'a>>,
}

impl<'a> Symtable<'a> {
    pub fn new() -> Self {
        Symtable::default()
    }

    pub fn child(&'a self) -> Symtable<'a> {
        Symtable {
            vars: FxHashMap::default(),
            parent: Some(self),
        }
    }

    pub fn declare(&mut self, name: &str, data_type: DataType) {
        self.vars.insert(name.to_string(), VarInfo { data_type });
    }

    pub fn find(&self, name: &str) -> Option<VarInfo> {
        match self.vars.get(name) {
            Some(info) => Some(*info),
            None => self.parent.and_then(|p| p.find(name)),
        }
    }
}
