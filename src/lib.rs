//! Relcache Library
//!
//! Relation cache and per-thread connection manager for SQL model builds.
//! The `relcache` binary in src/main.rs is a small diagnostic front end.

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod observability;
