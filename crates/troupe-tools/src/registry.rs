use std::collections::HashMap;
use std::sync::Arc;

use troupe_core::chat::{ToolDefinition, ToolOutput};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{Tool, ToolContext, ToolSource};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// List all registered tool names.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Definitions for a subset of tools, for sending to the model.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name under its own timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput> {
        let tool = self
            .lookup(name)
            .ok_or_else(|| TroupeError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TroupeError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::utc_now::UtcNowTool);
        registry.register(crate::builtin::http_get::HttpGetTool::new());
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSource for ToolRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use troupe_core::types::ExecutionId;

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps longer than its timeout"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                Ok(ToolOutput::success("done"))
            })
        }

        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            execution_id: ExecutionId::new(),
            node_id: "n1".into(),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("ghost", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::ToolNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_enforced() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry
            .execute("slow", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::ToolTimeout { .. }));
    }

    #[tokio::test]
    async fn builtins_resolve() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.lookup("utc_now").is_some());
        assert!(registry.lookup("http_get").is_some());
        let defs = registry.definitions_for(&["utc_now".into()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "utc_now");
    }
}
