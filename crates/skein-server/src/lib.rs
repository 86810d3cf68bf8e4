//! Skein Server - HTTP surface over the store and query pipeline

pub mod api;
pub mod config;
pub mod timestamp;

pub use api::{routes, shared_state, AppState, SharedState};
pub use config::{Config, ConfigError};
