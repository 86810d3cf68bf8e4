//! Per-table property catalog
//!
//! A `Table` is a loose schema: a named list of properties, each with a
//! stable id, a data type, and a transience flag. The catalog is what the
//! codec and the query compiler resolve names and types against.

use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("property name cannot be blank")]
    BlankPropertyName,

    #[error("property name contains invalid characters: {0}")]
    InvalidPropertyName(String),

    #[error("property already exists: {0}")]
    PropertyAlreadyExists(String),

    #[error("property not found: {0}")]
    PropertyNotFound(String),
}

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Factor,
    String,
    Integer,
    Float,
    Boolean,
}

impl DataType {
    /// Factor, integer and boolean values form discrete domains and may be
    /// used as selection dimensions; string and float may not.
    pub fn is_categorical(&self) -> bool {
        matches!(self, DataType::Factor | DataType::Integer | DataType::Boolean)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Factor => "factor",
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
        };
        write!(f, "{}", s)
    }
}

/// A schema column on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub transient: bool,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
}

fn valid_property_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

impl Property {
    pub fn new(id: i64, name: &str, transient: bool, data_type: DataType) -> Result<Self, SchemaError> {
        if name.is_empty() {
            return Err(SchemaError::BlankPropertyName);
        }
        if !valid_property_name(name) {
            return Err(SchemaError::InvalidPropertyName(name.to_string()));
        }
        Ok(Property {
            id,
            name: name.to_string(),
            transient,
            data_type,
        })
    }

    /// Coerces a value into this property's data type.
    ///
    /// Cast never fails: a value of the wrong kind is replaced by the type's
    /// zero value, so malformed input is quarantined per field rather than
    /// rejecting the whole event.
    pub fn cast(&self, value: Value) -> Value {
        match self.data_type {
            DataType::String => match value {
                Value::Str(s) => Value::Str(s),
                _ => Value::Str(String::new()),
            },
            DataType::Factor => match value {
                Value::Str(s) => Value::Str(s),
                Value::Id(n) => Value::Id(n),
                Value::Int(n) if n >= 0 => Value::Id(n as u64),
                _ => Value::Str(String::new()),
            },
            DataType::Integer => match value {
                Value::Int(n) => Value::Int(n),
                Value::Float(n) => Value::Int(n as i64),
                Value::Id(n) => Value::Int(n as i64),
                _ => Value::Int(0),
            },
            DataType::Float => match value {
                Value::Float(n) => Value::Float(n),
                Value::Int(n) => Value::Float(n as f64),
                _ => Value::Float(0.0),
            },
            DataType::Boolean => match value {
                Value::Bool(b) => Value::Bool(b),
                _ => Value::Bool(false),
            },
        }
    }
}

/// A table: a name plus its property catalog.
///
/// Queries snapshot the catalog behind an `Arc` at compile time, so mutation
/// always builds a fresh `Table` and swaps it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Table {
            name: name.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn property(&self, id: i64) -> Option<&Property> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Adds a property, allocating the next positive id.
    pub fn add_property(
        &mut self,
        name: &str,
        transient: bool,
        data_type: DataType,
    ) -> Result<Property, SchemaError> {
        if self.property_by_name(name).is_some() {
            return Err(SchemaError::PropertyAlreadyExists(name.to_string()));
        }
        let id = self.properties.iter().map(|p| p.id).max().unwrap_or(0).max(0) + 1;
        let property = Property::new(id, name, transient, data_type)?;
        self.properties.push(property.clone());
        Ok(property)
    }

    /// Translates a name-keyed payload into an id-keyed one, casting each
    /// value to its property's declared type. Unknown names are an error so
    /// that typos surface at the boundary instead of vanishing into storage.
    pub fn normalize(
        &self,
        data: &IndexMap<String, Value>,
    ) -> Result<std::collections::BTreeMap<i64, Value>, SchemaError> {
        let mut out = std::collections::BTreeMap::new();
        for (name, value) in data {
            let property = self
                .property_by_name(name)
                .ok_or_else(|| SchemaError::PropertyNotFound(name.clone()))?;
            out.insert(property.id, property.cast(value.clone()));
        }
        Ok(out)
    }

    /// Translates an id-keyed payload back to names. Ids without a declared
    /// property are surfaced under their decimal id.
    pub fn denormalize(
        &self,
        data: &std::collections::BTreeMap<i64, Value>,
    ) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        for (id, value) in data {
            match self.property(*id) {
                Some(p) => out.insert(p.name.clone(), value.clone()),
                None => out.insert(id.to_string(), value.clone()),
            };
        }
        out
    }
}
