//! # nexus-cli
//!
//! Command-line interface for the Nexus broker.
//!
//! ## Commands
//!
//! - `nexus start`: Run the broker and its HTTP API
//! - `nexus config`: Show the effective configuration
//! - `nexus doctor`: Audit configuration for safety issues
//! - `nexus audit verify`: Re-verify a persisted audit chain offline
//! - `nexus audit export`: Dump persisted audit entries
//! - `nexus completions`: Shell completions

pub mod commands;

pub use commands::Cli;
