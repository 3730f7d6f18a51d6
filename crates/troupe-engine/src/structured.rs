use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use troupe_core::chat::{ChatMessage, CompletionRequest};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::LlmClient;

/// Total validation attempts, counting the first parse.
pub const MAX_SCHEMA_ATTEMPTS: u32 = 3;

/// Outcome of structured-output enforcement. Exhausted retries are
/// recoverable: the raw text survives alongside `parse_error` and the
/// execution still succeeds.
#[derive(Debug, Clone)]
pub struct StructuredOutcome {
    pub raw: String,
    pub structured: Option<serde_json::Value>,
    pub parse_error: Option<String>,
    pub attempts: u32,
}

/// Validate `candidate` against `schema`, re-prompting the terminal
/// model with the validator's error paths up to three total attempts.
pub async fn enforce_schema(
    client: Option<Arc<dyn LlmClient>>,
    temperature: f32,
    schema: &serde_json::Value,
    candidate: String,
    cancel: &CancellationToken,
) -> Result<StructuredOutcome> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            // A schema that does not compile cannot be enforced; treat
            // it like an exhausted validation rather than a crash.
            warn!(error = %e, "output schema failed to compile");
            return Ok(StructuredOutcome {
                raw: candidate,
                structured: None,
                parse_error: Some(format!("schema compile error: {e}")),
                attempts: 0,
            });
        }
    };

    let mut current = candidate;
    let mut last_error = String::new();
    let mut attempts_done = 0;

    for attempt in 1..=MAX_SCHEMA_ATTEMPTS {
        attempts_done = attempt;
        if cancel.is_cancelled() {
            return Err(TroupeError::Cancelled);
        }

        match validate_candidate(&validator, &current) {
            Ok(value) => {
                debug!(attempt, "structured output validated");
                return Ok(StructuredOutcome {
                    raw: current,
                    structured: Some(value),
                    parse_error: None,
                    attempts: attempt,
                });
            }
            Err(error) => {
                warn!(attempt, error = %error, "structured output validation failed");
                last_error = error;
            }
        }

        if attempt == MAX_SCHEMA_ATTEMPTS {
            break;
        }
        let Some(client) = &client else {
            // No terminal model to re-prompt; keep the raw output.
            break;
        };

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You repair model output so it conforms to a JSON Schema. \
                     Respond with ONLY the corrected JSON, no prose, no code fences.",
                ),
                ChatMessage::user(corrective_prompt(schema, &current, &last_error)),
            ],
            temperature,
            max_tokens: None,
            tools: Vec::new(),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TroupeError::Cancelled),
            result = client.complete(request) => result,
        };
        match response {
            Ok(r) => current = r.text,
            Err(e) => {
                // The repair call itself failing ends the loop; the
                // caller still gets the raw output.
                warn!(error = %e, "structured-output repair call failed");
                last_error = format!("{last_error}; repair call failed: {e}");
                break;
            }
        }
    }

    Ok(StructuredOutcome {
        raw: current,
        structured: None,
        parse_error: Some(last_error),
        attempts: attempts_done,
    })
}

fn validate_candidate(
    validator: &jsonschema::Validator,
    candidate: &str,
) -> std::result::Result<serde_json::Value, String> {
    let cleaned = strip_code_fences(candidate);
    let value: serde_json::Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| format!("output is not valid JSON: {e}"))?;

    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| format!("{}: {}", e.instance_path, e))
        .collect();
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(errors.join("; "))
    }
}

fn corrective_prompt(schema: &serde_json::Value, output: &str, error: &str) -> String {
    format!(
        "The previous output failed JSON Schema validation.\n\n\
         Schema:\n{schema}\n\n\
         Previous output:\n{output}\n\n\
         Validation errors:\n{error}\n\n\
         Produce a corrected JSON document that satisfies the schema."
    )
}

/// Strip markdown code fences around a JSON payload.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    for fence in ["```json", "```"] {
        if let Some(rest) = trimmed.strip_prefix(fence) {
            if let Some(end) = rest.rfind("```") {
                return rest[..end].trim();
            }
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_llm::MockLlm;

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["answer"],
            "properties": {"answer": {"type": "integer"}}
        })
    }

    #[tokio::test]
    async fn valid_first_try() {
        let outcome = enforce_schema(
            None,
            0.2,
            &schema(),
            r#"{"answer": 42}"#.into(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.structured.unwrap()["answer"], 42);
        assert!(outcome.parse_error.is_none());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn code_fences_are_tolerated() {
        let outcome = enforce_schema(
            None,
            0.2,
            &schema(),
            "```json\n{\"answer\": 7}\n```".into(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.structured.unwrap()["answer"], 7);
    }

    #[tokio::test]
    async fn invalid_then_repaired() {
        let mock = Arc::new(MockLlm::new());
        mock.push_text(r#"{"answer": 42}"#);

        let outcome = enforce_schema(
            Some(mock.clone()),
            0.2,
            &schema(),
            "hello".into(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.structured.unwrap()["answer"], 42);
        assert!(outcome.parse_error.is_none());
        assert_eq!(outcome.attempts, 2);

        // The corrective prompt carried the schema and the error.
        let requests = mock.requests();
        let user = &requests[0].messages[1].content;
        assert!(user.contains("failed JSON Schema validation"));
        assert!(user.contains("answer"));
    }

    #[tokio::test]
    async fn exhausted_retries_keep_raw_and_set_parse_error() {
        let mock = Arc::new(MockLlm::new());
        mock.push_text("still not json");
        mock.push_text("nope");

        let outcome = enforce_schema(
            Some(mock.clone()),
            0.2,
            &schema(),
            "hello".into(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(outcome.structured.is_none());
        assert_eq!(outcome.raw, "nope");
        assert!(outcome.parse_error.as_ref().unwrap().contains("not valid JSON"));
        assert_eq!(outcome.attempts, MAX_SCHEMA_ATTEMPTS);
        assert_eq!(mock.calls(), 2, "two repair calls across three attempts");
    }

    #[tokio::test]
    async fn schema_violation_reports_path() {
        let outcome = enforce_schema(
            None,
            0.2,
            &schema(),
            r#"{"answer": "forty-two"}"#.into(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let err = outcome.parse_error.unwrap();
        assert!(err.contains("/answer"), "error should name the path: {err}");
    }

    #[tokio::test]
    async fn without_client_no_repair_attempted() {
        let outcome = enforce_schema(
            None,
            0.2,
            &schema(),
            "not json".into(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(outcome.structured.is_none());
        assert_eq!(outcome.raw, "not json");
        assert!(outcome.parse_error.is_some());
    }
}
