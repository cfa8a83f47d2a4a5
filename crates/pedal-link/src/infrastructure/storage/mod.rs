//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML settings file from the
//! platform-appropriate directory, falls back to defaults on first run, and
//! converts the on-disk settings into the runtime types the connection
//! service and transports take.

pub mod config;
