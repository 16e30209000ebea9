//! Repository traffic tracking: polls the upstream traffic API, merges daily
//! records into a pluggable store and answers summary queries over them.
pub mod api;
pub mod badge;
pub mod config;
pub mod github;
pub mod metrics_defs;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod summary;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testutils;
