//! MCP server implementation using rmcp.
//!
//! Exposes the execution pipeline as a single `execute` tool.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer {
    orchestrator: Orchestrator,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// Source of the program to run.
    #[schemars(description = "Complete source of the program to run")]
    pub code: String,
}

#[tool_router]
impl SandboxServer {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    /// Run one program in a fresh sandbox.
    #[tool(description = "Run a program in a disposable sandbox and return its execution result")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(code_len = params.code.len(), "Executing code");

        let result = self.orchestrator.execute(&params.code).await;
        let body = serde_json::to_string_pretty(&result).map_err(|e| {
            error!(error = %e, "Failed to encode result");
            McpError::internal_error(format!("Failed to encode result: {e}"), None)
        })?;

        if result.is_ok() {
            Ok(CallToolResult::success(vec![Content::text(body)]))
        } else {
            Ok(CallToolResult::error(vec![Content::text(body)]))
        }
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let config = self.orchestrator.config();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "playground-executor".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run untrusted programs in disposable sandboxes.\n\
                 Use the 'execute' tool with:\n\
                 - code: the contents of {entry} (run with {command:?}, \
                 {timeout}s timeout)\n\
                 The result is JSON with status, exit_code, stdout, stderr \
                 and times in nanoseconds.",
                entry = config.entry_file,
                command = config.run_command,
                timeout = config.timeout_seconds,
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let server = SandboxServer::new(orchestrator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
