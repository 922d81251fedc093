//! playground-executor library
//!
//! This crate runs untrusted program submissions in disposable sandboxes:
//! - Configuration parsing from JSON
//! - Isolation backends (host directory, Docker container)
//! - Execution records and their normalization
//! - The orchestrator that drives one submission end to end
//! - MCP server implementation using rmcp

pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod record;
