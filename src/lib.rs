//! letterbox: newsletter triage with an optimistic, rollback-safe cache.
//!
//! - [`storage`]: SQLite store for newsletters, sources, tags and the reading queue
//! - [`remote`]: the store contract the engine writes through
//! - [`cache`]: keyed query cache with fetch tickets, write holds and snapshots
//! - [`aggregate`]: unread and per-source count deltas
//! - [`engine`]: optimistic mutations, queries and queue reordering
//! - [`config`]: TOML configuration

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod remote;
pub mod storage;
pub mod util;
