//! psql-front: a read-through caching proxy speaking the PostgreSQL wire
//! protocol
//!
//! Clients connect as if to a PostgreSQL server; the proxy forwards traffic
//! to the real upstream while transparently keeping origin-backed tables
//! fresh. A query touching a managed table triggers a freshness check of
//! the table's cache metadata; stale or missing tables are refreshed from
//! their origin before the query reaches the upstream.
//!
//! ## Module map
//!
//! - [`pg_wire`] — wire-protocol proxy: framing, negotiation, passthrough
//! - [`query`] — SQL analysis: which tables does a statement read
//! - [`cache`] — cache controller: hit/miss classification and refresh
//! - [`origin`] — origin contract, type registry, built-in origins
//! - [`server`] — lifecycle: bootstrap, accept loop, query handler
//! - [`config`] / [`tls`] / [`stats`] / [`telemetry`] — ambient concerns

pub mod cache;
pub mod config;
pub mod error;
pub mod origin;
pub mod pg_wire;
pub mod query;
pub mod server;
pub mod stats;
pub mod table;
pub mod telemetry;
pub mod tls;

pub use config::Config;
pub use error::Error;
pub use origin::{CacheWriter, Origin};
pub use query::{analyze_query, QueryAnalysis};
pub use server::Server;
pub use table::{Column, Table};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
