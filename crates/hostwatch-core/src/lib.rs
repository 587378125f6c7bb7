//! Discovery, reconciliation and live execution of host JVM services.
//!
//! [`inspect`] finds what is running, [`reconcile`] folds that into the
//! registry, [`exec`] launches and stops entries with streamed output.
//! [`service::HostwatchService`] ties them together for the CLI.

pub mod autostart;
pub mod container;
pub mod error;
pub mod exec;
pub mod identity;
pub mod inspect;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod signal;

pub use error::{HostwatchError, Result};
pub use service::HostwatchService;
