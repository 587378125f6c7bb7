//! Persistence for the host service registry.
//!
//! One table, `registry_entries`, holds every JVM service known to each
//! worker host. Query functions live under [`queries`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
