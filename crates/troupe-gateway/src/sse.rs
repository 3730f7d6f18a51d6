use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use futures::Stream;
use serde::Deserialize;
use tracing::debug;

use troupe_core::redact::redact_value;
use troupe_core::types::{ExecutionId, ExecutionLog};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    /// Alternative to the Last-Event-ID header for plain HTTP clients.
    pub since_sequence: Option<u64>,
}

/// GET /executions/{id}/stream — `text/event-stream` with
/// `id: <sequence>` frames, resumable via `Last-Event-ID`.
pub async fn stream_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let execution_id = ExecutionId::parse(&id);
    // 404 before the stream starts.
    state.manager.get(&execution_id).await?;

    let since = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.since_sequence)
        .unwrap_or(0);

    let mut subscription = state.bus.subscribe(&execution_id, since).await?;
    let heartbeat = Duration::from_secs(state.config.heartbeat_seconds.max(1));
    debug!(execution_id = %execution_id, since, "SSE subscriber attached");

    let stream = async_stream::stream! {
        let mut last_sequence = since;
        loop {
            match tokio::time::timeout(heartbeat, subscription.next()).await {
                Ok(Some(row)) => {
                    last_sequence = row.sequence;
                    let terminal = is_terminal_event(&row.event_type);
                    yield Ok(event_frame(&row));
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    // Synthetic, not persisted: keeps idle streams alive
                    // and tells the client where the log currently ends.
                    yield Ok(Event::default().event("heartbeat").data(
                        serde_json::json!({ "next_sequence": last_sequence + 1 }).to_string(),
                    ));
                }
            }
        }
    };

    Ok(Sse::new(stream))
}

fn is_terminal_event(event_type: &str) -> bool {
    matches!(
        event_type,
        "execution_completed" | "execution_failed" | "execution_timeout" | "execution_cancelled"
    )
}

/// Build one SSE frame: `id` is the sequence, `event` the type, `data`
/// the redacted event payload.
fn event_frame(row: &ExecutionLog) -> Event {
    let mut payload = match &row.extra_data {
        Some(serde_json::Value::Object(fields)) => fields.clone(),
        _ => serde_json::Map::new(),
    };
    payload.insert(
        "execution_id".into(),
        serde_json::Value::String(row.execution_id.to_string()),
    );
    payload.insert("sequence".into(), serde_json::json!(row.sequence));
    payload.insert(
        "timestamp".into(),
        serde_json::Value::String(row.timestamp.to_rfc3339()),
    );

    let data = redact_value(&serde_json::Value::Object(payload));
    Event::default()
        .id(row.sequence.to_string())
        .event(row.event_type.clone())
        .data(data.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(event_type: &str, extra: serde_json::Value) -> ExecutionLog {
        ExecutionLog {
            id: 1,
            execution_id: ExecutionId::parse("e-1"),
            sequence: 7,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            node_id: None,
            agent_id: None,
            supervisor_id: None,
            message: "m".into(),
            extra_data: Some(extra),
        }
    }

    #[test]
    fn terminal_event_classification() {
        assert!(is_terminal_event("execution_completed"));
        assert!(is_terminal_event("execution_cancelled"));
        assert!(!is_terminal_event("node_completed"));
        assert!(!is_terminal_event("heartbeat"));
    }

    #[test]
    fn frame_carries_id_type_and_payload() {
        let event = event_frame(&row(
            "node_completed",
            serde_json::json!({"type": "node_completed", "node_id": "a1"}),
        ));
        // The axum Event debug output includes the wire fields.
        let rendered = format!("{event:?}");
        assert!(rendered.contains('7'));
        assert!(rendered.contains("node_completed"));
        assert!(rendered.contains("a1"));
        assert!(rendered.contains("e-1"));
    }

    #[test]
    fn frame_payload_is_redacted() {
        let event = event_frame(&row(
            "tool_call",
            serde_json::json!({
                "type": "tool_call",
                "input": {"api_key": "sk-ant-REDACTED"},
            }),
        ));
        let rendered = format!("{event:?}");
        assert!(!rendered.contains("sk-ant-0123456789"));
        assert!(rendered.contains("REDACTED"));
    }
}
