use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use troupe_core::chat::{CompletionRequest, CompletionResponse, ToolCall};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::LlmClient;

/// One scripted reply.
#[derive(Clone)]
pub enum MockReply {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Error(String),
}

/// Deterministic scripted client for tests. Replies are served FIFO;
/// when the queue is empty the client echoes the last user message so
/// prompt assembly can be asserted without scripting every call.
pub struct MockLlm {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Text(text.into()));
    }

    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::ToolCalls(calls));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Error(message.into()));
    }

    /// Number of completed calls so far.
    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Copy of every request seen, for assertions.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for MockLlm {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let scripted = self.replies.lock().unwrap().pop_front();
            self.requests.lock().unwrap().push(request.clone());

            match scripted {
                Some(MockReply::Text(text)) => Ok(CompletionResponse::text_only(text)),
                Some(MockReply::ToolCalls(tool_calls)) => Ok(CompletionResponse {
                    text: String::new(),
                    tool_calls,
                }),
                Some(MockReply::Error(message)) => Err(TroupeError::LlmRequest(message)),
                None => {
                    let last_user = request
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == troupe_core::chat::Role::User)
                        .map(|m| m.content.as_str())
                        .unwrap_or("");
                    Ok(CompletionResponse::text_only(format!("echo: {last_user}")))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::chat::ChatMessage;

    #[tokio::test]
    async fn serves_queue_then_echoes() {
        let mock = MockLlm::new();
        mock.push_text("first");

        let req = CompletionRequest::new(vec![ChatMessage::user("hello")]);
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "first");
        assert_eq!(mock.complete(req).await.unwrap().text, "echo: hello");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_error_surfaces() {
        let mock = MockLlm::new();
        mock.push_error("HTTP 400 bad request");
        let req = CompletionRequest::new(vec![ChatMessage::user("x")]);
        assert!(mock.complete(req).await.is_err());
    }
}
