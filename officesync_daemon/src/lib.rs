//! officesync daemon: keeps dashboard viewers in sync with the on-disk agent
//! fleet, records metrics history and maintains verifiable backups.

pub mod api;
pub mod archive;
pub mod backup;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod sampler;
pub mod state;
pub mod store;
pub mod types;
pub mod watcher;
pub mod ws;
