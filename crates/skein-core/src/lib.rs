//! Skein Core - Types and query AST for the Skein behavioral event store
//!
//! This crate provides the foundational types shared by the store and the
//! query pipeline: runtime values, the per-table property catalog, events,
//! the query AST with its JSON wire format, and the query validator.

pub mod ast;
pub mod event;
pub mod expr;
pub mod schema;
pub mod validate;
pub mod value;

pub use ast::{Query, Statement, WithinUnits};
pub use event::Event;
pub use schema::{DataType, Property, SchemaError, Table};
pub use validate::{validate, ValidationError};
pub use value::Value;
