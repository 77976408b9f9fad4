//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the repository traits defined in
//! `stepwise-core`: SQLite storage for definitions, executions and durable
//! wakes, plus the data directory and `config.toml` loader.

pub mod config;
pub mod sqlite;
