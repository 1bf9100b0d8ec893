//! MSSQL MCP Server Library
//!
//! This library provides MCP (Model Context Protocol) tools for AI agents
//! to interact with a Microsoft SQL Server instance: read-only queries,
//! catalog introspection, and (behind an explicit flag) transactional
//! writes and allowlisted stored procedures.

pub mod config;
pub mod db;
pub mod error;
pub mod mcp;
pub mod models;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::DbError;
pub use mcp::MssqlService;
