use futures::future::BoxFuture;

use troupe_core::chat::ToolOutput;
use troupe_core::error::Result;
use troupe_core::traits::{Tool, ToolContext};

/// Returns the current UTC timestamp.
pub struct UtcNowTool;

impl Tool for UtcNowTool {
    fn name(&self) -> &str {
        "utc_now"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC (RFC 3339)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async { Ok(ToolOutput::success(chrono::Utc::now().to_rfc3339())) })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}
