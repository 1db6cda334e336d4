//! Serializd→Discord relay: watches tracked users' show diaries on the
//! upstream service and posts newly-logged entries to Discord channels,
//! exactly once per entry, surviving restarts via durable per-user cursors.

pub mod config;
pub mod db;
pub mod discord;
pub mod model;
pub mod pipeline;
pub mod serializd;
