//! MSSQL MCP Server - Main entry point.
//!
//! This server provides MCP (Model Context Protocol) tools for AI agents
//! to interact with a Microsoft SQL Server instance, read-only by default.

use clap::Parser;
use mssql_mcp_server::config::{Config, TransportMode};
use mssql_mcp_server::db::{MssqlFactory, SqlPool};
use mssql_mcp_server::tools::ToolContext;
use mssql_mcp_server::transport::{HttpTransport, StdioTransport, Transport};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Everything goes to stderr: on the stdio transport, stdout belongs to
/// the MCP protocol and a single stray log line would corrupt framing.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(message) = config.validate() {
        eprintln!("Error: {message}");
        eprintln!();
        eprintln!("Usage: mssql-mcp-server --host <host> --user <user> --password <password>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  mssql-mcp-server --host db.example.com --user reader --password secret");
        eprintln!("  mssql-mcp-server --host db.example.com --database sales --allow-write");
        eprintln!("  MSSQL_PASSWORD=secret mssql-mcp-server --host db.example.com");
        std::process::exit(1);
    }

    info!(
        transport = %config.transport,
        host = %config.host,
        port = config.port,
        database = %config.database,
        "Starting MSSQL MCP Server v{}",
        env!("CARGO_PKG_VERSION")
    );

    if config.allow_write {
        warn!(
            allowlisted_procedures = config.procedure_allowlist().len(),
            "Write mode enabled: INSERT/UPDATE/DELETE and allowlisted procedures are accepted"
        );
    }

    // Build the pool and prove connectivity before serving any tool call
    let factory = MssqlFactory::new(config.connect_options());
    let pool = SqlPool::new(config.pool_settings(), factory);

    info!(
        min = config.min_pool_size,
        max = config.max_pool_size,
        "Warming up connection pool"
    );
    if let Err(e) = pool.warm_up().await {
        error!(error = %e, "Could not establish initial connections");
        return Err(e.into());
    }

    let context = Arc::new(ToolContext::new(&config, pool));

    // Run the appropriate transport
    let result = match config.transport {
        TransportMode::Stdio => {
            info!("Using stdio transport");
            let transport = StdioTransport::new(context);
            transport.run().await
        }
        TransportMode::Http => {
            info!(
                host = %config.http_host,
                port = config.http_port,
                endpoint = %config.mcp_endpoint,
                "Using HTTP transport"
            );
            let transport = HttpTransport::new(
                context,
                &config.http_host,
                config.http_port,
                &config.mcp_endpoint,
            );
            transport.run().await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
