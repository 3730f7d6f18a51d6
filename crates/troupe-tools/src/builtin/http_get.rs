use futures::future::BoxFuture;
use reqwest::Client;

use troupe_core::chat::ToolOutput;
use troupe_core::error::Result;
use troupe_core::traits::{Tool, ToolContext};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Fetches a URL and returns the (truncated) response body.
pub struct HttpGetTool {
    http: Client,
}

impl HttpGetTool {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for HttpGetTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "http_get"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return the response body (truncated to 64 KiB)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL to fetch"}
            },
            "required": ["url"],
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let Some(url) = input.get("url").and_then(|u| u.as_str()) else {
                return Ok(ToolOutput::error("missing required field: url"));
            };
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Ok(ToolOutput::error("url must be http(s)"));
            }

            match self.http.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let truncated: String = body.chars().take(MAX_BODY_BYTES).collect();
                    if status.is_success() {
                        Ok(ToolOutput::success(truncated))
                    } else {
                        Ok(ToolOutput::error(format!("HTTP {}: {truncated}", status.as_u16())))
                    }
                }
                Err(e) => Ok(ToolOutput::error(format!("request failed: {e}"))),
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        30
    }
}
