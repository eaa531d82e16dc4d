//! NestTask offline sync core.
//!
//! Lets tasks, routines, courses, teachers and study materials be read and
//! edited while disconnected, and replays the local changes against the
//! remote API once connectivity returns.

pub mod config;
pub mod connectivity;
pub mod errors;
pub mod freshness;
pub mod models;
pub mod remote;
pub mod repository;
pub mod store;
pub mod sync;

pub use config::Config;
pub use connectivity::{ConnectivityProbe, ConnectivitySignal};
pub use errors::SyncError;
pub use store::{init_database, LocalStore};
pub use sync::{Remotes, SyncEngine, SyncReport, SyncSummary, Workspace};

#[cfg(test)]
mod tests;
