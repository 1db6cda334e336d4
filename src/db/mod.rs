//! Database module: the durable tracked-user registry.
//!
//! The registry is the only persistent, shared mutable state in the pipeline.
//! Each row binds one upstream username to one delivery destination and
//! carries that pair's ingestion cursor; the cursor columns are the sole
//! record of what has already been delivered, so they must survive restarts.

pub mod repo;

pub use repo::*;
