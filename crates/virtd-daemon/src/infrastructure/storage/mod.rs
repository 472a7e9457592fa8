//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the daemon's TOML configuration, falls back
//! to defaults when the file does not exist, and can write a configuration
//! back out (used to generate a starting file).

pub mod config;
