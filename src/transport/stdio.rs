//! Stdio transport for the MCP server.
//!
//! This transport uses standard input/output for communication,
//! which is the standard mode for CLI-based MCP integrations. Log output
//! goes to stderr; stdout carries nothing but protocol frames.

use crate::error::{DbError, DbResult};
use crate::mcp::MssqlService;
use crate::tools::ToolContext;
use crate::transport::{POOL_SHUTDOWN_GRACE, Transport};
use rmcp::{ServiceExt, transport::stdio};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// Stdio transport implementation.
///
/// Reads JSON-RPC messages from stdin and writes responses to stdout,
/// following the MCP protocol specification.
pub struct StdioTransport {
    context: Arc<ToolContext>,
}

impl StdioTransport {
    /// Create a new stdio transport over the shared tool context.
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!("Starting MCP server with stdio transport");

        let service = MssqlService::new(self.context.clone());

        let transport = stdio();
        let running_service = service
            .serve(transport)
            .await
            .map_err(|e| DbError::internal(format!("Failed to start stdio transport: {e}")))?;

        let shutdown_requested = tokio::select! {
            result = running_service.waiting() => {
                match result {
                    Ok(_quit_reason) => {
                        info!("Stdio transport completed normally");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Stdio transport error");
                        return Err(DbError::internal(format!("Stdio transport error: {e}")));
                    }
                }
                false
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received (send again to force exit)");
                true
            }
        };

        if shutdown_requested {
            // A second signal skips the drain and exits immediately.
            tokio::spawn(async {
                wait_for_signal().await;
                tracing::warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        info!("Closing connection pool");
        self.context.pool.shutdown(POOL_SHUTDOWN_GRACE).await;

        if shutdown_requested {
            // tokio::select! cannot interrupt a blocking stdin read, so the
            // process has to exit explicitly once the pool is drained.
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{MssqlFactory, SqlPool};

    #[test]
    fn test_stdio_transport_creation() {
        let config = Config::default_config();
        let pool = SqlPool::new(config.pool_settings(), MssqlFactory::new(config.connect_options()));
        let transport = StdioTransport::new(Arc::new(ToolContext::new(&config, pool)));
        assert_eq!(transport.name(), "stdio");
    }
}
