//! MCP driver: `mcp_query(Tool, Args, Result)`.
//!
//! The actual MCP client is an external collaborator; this handler routes
//! through an injected transport so the kernel sees tool calls as plain
//! fact queries.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;
use crate::vstore::handler::{VirtualHandler, VirtualQuery};

/// Opaque MCP transport.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Invoke a named tool with JSON arguments.
    async fn call(
        &self,
        tool: &str,
        args: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value>;
}

/// `mcp_query(Tool, Args, Result)`: Tool is a name, Args and Result are
/// JSON strings.
pub struct McpQueryHandler {
    capsule: PermissionCapsule,
    transport: Arc<dyn McpTransport>,
}

impl McpQueryHandler {
    /// Create a handler over an injected transport.
    pub fn new(capsule: PermissionCapsule, transport: Arc<dyn McpTransport>) -> Self {
        Self { capsule, transport }
    }
}

#[async_trait]
impl VirtualHandler for McpQueryHandler {
    fn predicate(&self) -> &str {
        "mcp_query"
    }

    fn arity(&self) -> usize {
        3
    }

    fn capsule(&self) -> &PermissionCapsule {
        &self.capsule
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let tool = query
            .require(0)?
            .as_name()
            .ok_or_else(|| Error::type_mismatch(&query.predicate, 0, "name", "non-name"))?
            .to_string();
        let args_text = query
            .bound(1)
            .and_then(|c| c.as_str())
            .unwrap_or("{}")
            .to_string();
        let args: serde_json::Value = serde_json::from_str(&args_text)?;

        let result = self.transport.call(&tool, &args, cancel).await?;
        Ok(vec![vec![
            Const::name(tool),
            Const::string(args_text),
            Const::string(result.to_string()),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTransport;

    #[async_trait]
    impl McpTransport for EchoTransport {
        async fn call(
            &self,
            tool: &str,
            args: &serde_json::Value,
            _cancel: &CancellationToken,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "tool": tool, "echo": args }))
        }
    }

    #[tokio::test]
    async fn test_mcp_round_trip() {
        let handler = McpQueryHandler::new(
            PermissionCapsule::deny_all(),
            Arc::new(EchoTransport),
        );
        let cancel = CancellationToken::new();
        let pattern = vec![
            Some(Const::name("search")),
            Some(Const::string(r#"{"q":"x"}"#)),
        ];
        let q = VirtualQuery::from_pattern("mcp_query", &pattern, 3);
        let tuples = handler.invoke(&q, &cancel).await.unwrap();
        assert_eq!(tuples[0][0], Const::name("search"));
        let result: serde_json::Value =
            serde_json::from_str(tuples[0][2].as_str().unwrap()).unwrap();
        assert_eq!(result["tool"], "search");
    }
}
