//! Port configuration registry for concurrent integration-test runs.
//!
//! A fixed catalog of disjoint port sets is leased to clients by key, expired
//! leases are swept back into the pool, and a small line-protocol service
//! exposes reserve, release and ban to build tooling.

pub mod catalog;
pub mod client;
pub mod logging;
pub mod ports;
pub mod provision;
pub mod server;
pub mod service;
pub mod settings;
pub mod store;
pub mod sweeper;
