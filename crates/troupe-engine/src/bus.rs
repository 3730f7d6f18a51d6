use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use troupe_core::error::{Result, TroupeError};
use troupe_core::event::ExecutionEvent;
use troupe_core::traits::{ExecutionLogRepo, NewLogEntry};
use troupe_core::types::{ExecutionId, ExecutionLog};

/// Mailbox capacity per subscriber. A subscriber that falls this far
/// behind is disconnected; its next reconnect resumes losslessly from
/// its last received sequence.
pub const SUBSCRIBER_BUFFER: usize = 128;

/// How long a finished topic stays attached for late subscribers before
/// its resources are reclaimed and reads go straight to the log.
pub const TERMINAL_LINGER: Duration = Duration::from_secs(60);

/// Per-execution ordered pub/sub with durable replay.
///
/// Every publish persists the log row first and only then fans out to
/// live subscribers, all under the topic lock, so a subscriber can
/// never observe a sequence that is not in the log.
pub struct ExecutionBus {
    logs: Arc<dyn ExecutionLogRepo>,
    topics: Mutex<HashMap<ExecutionId, Arc<Topic>>>,
    linger: Duration,
}

struct Topic {
    inner: tokio::sync::Mutex<TopicInner>,
}

struct TopicInner {
    /// Sequence the next event will receive; starts at 1.
    next_sequence: u64,
    subscribers: Vec<mpsc::Sender<ExecutionLog>>,
    /// Set once the terminal event has been published.
    closed: bool,
}

/// A subscription: replayed backlog followed by the live feed.
pub struct Subscription {
    backlog: std::vec::IntoIter<ExecutionLog>,
    live: Option<mpsc::Receiver<ExecutionLog>>,
}

impl Subscription {
    /// Next event in sequence order; `None` when the stream is drained
    /// (log exhausted and, if attached, the topic reclaimed).
    pub async fn next(&mut self) -> Option<ExecutionLog> {
        if let Some(event) = self.backlog.next() {
            return Some(event);
        }
        match &mut self.live {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// True when a live feed is attached (the execution was still
    /// in-flight, or lingering, at subscribe time).
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }
}

impl ExecutionBus {
    pub fn new(logs: Arc<dyn ExecutionLogRepo>) -> Self {
        Self::with_linger(logs, TERMINAL_LINGER)
    }

    pub fn with_linger(logs: Arc<dyn ExecutionLogRepo>, linger: Duration) -> Self {
        Self {
            logs,
            topics: Mutex::new(HashMap::new()),
            linger,
        }
    }

    /// Open the topic for a new execution. Called once at trigger time,
    /// before any publish.
    pub fn open(&self, execution_id: &ExecutionId) {
        let mut topics = self.topics.lock().unwrap();
        topics.entry(execution_id.clone()).or_insert_with(|| {
            Arc::new(Topic {
                inner: tokio::sync::Mutex::new(TopicInner {
                    next_sequence: 1,
                    subscribers: Vec::new(),
                    closed: false,
                }),
            })
        });
    }

    fn topic(&self, execution_id: &ExecutionId) -> Option<Arc<Topic>> {
        self.topics.lock().unwrap().get(execution_id).cloned()
    }

    /// Persist-then-publish one event. Returns the assigned sequence.
    ///
    /// A failed log write is retried once synchronously; a second
    /// failure propagates and the caller fails the execution.
    pub async fn publish(
        self: &Arc<Self>,
        execution_id: &ExecutionId,
        event: ExecutionEvent,
    ) -> Result<u64> {
        let topic = self.topic(execution_id).ok_or_else(|| {
            TroupeError::Database(format!("no open topic for execution {execution_id}"))
        })?;

        let mut inner = topic.inner.lock().await;
        // Terminal states are absorbing; publishing past the terminal
        // event is a programming error.
        assert!(
            !inner.closed,
            "publish after terminal event on execution {execution_id}"
        );

        let sequence = inner.next_sequence;
        let entry = NewLogEntry {
            execution_id: execution_id.clone(),
            sequence,
            timestamp: Utc::now(),
            event_type: event.event_type().to_string(),
            node_id: event.node_id().map(String::from),
            agent_id: match &event {
                ExecutionEvent::ToolCall { node_id, .. }
                | ExecutionEvent::LlmRetry { node_id, .. } => Some(node_id.clone()),
                _ => None,
            },
            supervisor_id: event.supervisor_id().map(String::from),
            message: event.message(),
            extra_data: Some(serde_json::to_value(&event)?),
        };

        if let Err(first) = self.logs.append(&entry).await {
            warn!(execution_id = %execution_id, error = %first, "log append failed, retrying once");
            self.logs.append(&entry).await?;
        }
        inner.next_sequence = sequence + 1;

        let row = ExecutionLog {
            id: 0,
            execution_id: entry.execution_id,
            sequence: entry.sequence,
            timestamp: entry.timestamp,
            event_type: entry.event_type,
            node_id: entry.node_id,
            agent_id: entry.agent_id,
            supervisor_id: entry.supervisor_id,
            message: entry.message,
            extra_data: entry.extra_data,
        };

        // Fan out without blocking: a full mailbox disconnects that
        // subscriber, not the execution.
        inner.subscribers.retain(|tx| match tx.try_send(row.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(execution_id = %execution_id, "subscriber buffer full, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if event.is_terminal() {
            inner.closed = true;
            drop(inner);
            self.schedule_reclaim(execution_id.clone());
        }

        Ok(sequence)
    }

    fn schedule_reclaim(self: &Arc<Self>, execution_id: ExecutionId) {
        let bus = Arc::clone(self);
        let linger = self.linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let topic = bus.topics.lock().unwrap().remove(&execution_id);
            if let Some(topic) = topic {
                // Dropping the senders ends every remaining live stream.
                topic.inner.lock().await.subscribers.clear();
                debug!(execution_id = %execution_id, "topic reclaimed after linger");
            }
        });
    }

    /// Subscribe from `since_sequence` (exclusive). Replays persisted
    /// rows first, then attaches to the live feed with no gap and no
    /// duplicate. For finished executions the stream reads purely from
    /// the log and ends.
    pub async fn subscribe(
        &self,
        execution_id: &ExecutionId,
        since_sequence: u64,
    ) -> Result<Subscription> {
        if let Some(topic) = self.topic(execution_id) {
            // Snapshot the attachment point under the topic lock: every
            // sequence below it is already durable, everything at or
            // above it will arrive in the mailbox.
            let (upper, live) = {
                let mut inner = topic.inner.lock().await;
                let upper = inner.next_sequence;
                let live = if inner.closed {
                    None
                } else {
                    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                    inner.subscribers.push(tx);
                    Some(rx)
                };
                (upper, live)
            };
            let backlog = self.logs.range(execution_id, since_sequence, upper).await?;
            return Ok(Subscription {
                backlog: backlog.into_iter(),
                live,
            });
        }

        let backlog = self
            .logs
            .range(execution_id, since_sequence, u64::MAX)
            .await?;
        Ok(Subscription {
            backlog: backlog.into_iter(),
            live: None,
        })
    }

    /// The sequence the next event would get; `None` when the topic is
    /// gone (finished and reclaimed).
    pub async fn next_sequence(&self, execution_id: &ExecutionId) -> Option<u64> {
        let topic = self.topic(execution_id)?;
        let inner = topic.inner.lock().await;
        Some(inner.next_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use troupe_core::traits::LogFilter;

    /// In-memory log repo; can inject append failures.
    struct MemLogs {
        rows: Mutex<Vec<ExecutionLog>>,
        fail_next: AtomicU32,
    }

    impl MemLogs {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
            })
        }
    }

    impl ExecutionLogRepo for MemLogs {
        fn append(&self, entry: &NewLogEntry) -> BoxFuture<'_, Result<()>> {
            let entry = entry.clone();
            Box::pin(async move {
                if self.fail_next.load(Ordering::SeqCst) > 0 {
                    self.fail_next.fetch_sub(1, Ordering::SeqCst);
                    return Err(TroupeError::Database("injected failure".into()));
                }
                let mut rows = self.rows.lock().unwrap();
                let id = rows.len() as i64 + 1;
                rows.push(ExecutionLog {
                    id,
                    execution_id: entry.execution_id,
                    sequence: entry.sequence,
                    timestamp: entry.timestamp,
                    event_type: entry.event_type,
                    node_id: entry.node_id,
                    agent_id: entry.agent_id,
                    supervisor_id: entry.supervisor_id,
                    message: entry.message,
                    extra_data: entry.extra_data,
                });
                Ok(())
            })
        }

        fn range(
            &self,
            execution_id: &ExecutionId,
            after: u64,
            before: u64,
        ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>> {
            let execution_id = execution_id.clone();
            Box::pin(async move {
                let rows = self.rows.lock().unwrap();
                Ok(rows
                    .iter()
                    .filter(|r| {
                        r.execution_id == execution_id && r.sequence > after && r.sequence < before
                    })
                    .cloned()
                    .collect())
            })
        }

        fn query(
            &self,
            execution_id: &ExecutionId,
            _filter: LogFilter,
        ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>> {
            self.range(execution_id, 0, u64::MAX)
        }

        fn last_sequence(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<u64>> {
            let execution_id = execution_id.clone();
            Box::pin(async move {
                let rows = self.rows.lock().unwrap();
                Ok(rows
                    .iter()
                    .filter(|r| r.execution_id == execution_id)
                    .map(|r| r.sequence)
                    .max()
                    .unwrap_or(0))
            })
        }
    }

    fn started() -> ExecutionEvent {
        ExecutionEvent::ExecutionStarted {
            team_id: "t".into(),
            task: "ping".into(),
        }
    }

    fn entered(node: &str) -> ExecutionEvent {
        ExecutionEvent::NodeEntered {
            node_id: node.into(),
        }
    }

    fn completed() -> ExecutionEvent {
        ExecutionEvent::ExecutionCompleted {
            output_preview: "done".into(),
        }
    }

    #[tokio::test]
    async fn sequences_are_gapless_from_one() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::new(logs.clone()));
        let id = ExecutionId::new();
        bus.open(&id);

        assert_eq!(bus.publish(&id, started()).await.unwrap(), 1);
        assert_eq!(bus.publish(&id, entered("a")).await.unwrap(), 2);
        assert_eq!(bus.publish(&id, entered("b")).await.unwrap(), 3);

        let rows = logs.range(&id, 0, u64::MAX).await.unwrap();
        let seqs: Vec<u64> = rows.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn live_subscriber_sees_only_persisted_events() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::new(logs.clone()));
        let id = ExecutionId::new();
        bus.open(&id);

        bus.publish(&id, started()).await.unwrap();
        let mut sub = bus.subscribe(&id, 0).await.unwrap();
        assert!(sub.is_live());

        bus.publish(&id, entered("a")).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.sequence, 1);
        let second = sub.next().await.unwrap();
        assert_eq!(second.sequence, 2);
        // Persist-before-publish: each delivered row is already durable.
        assert!(logs.last_sequence(&id).await.unwrap() >= second.sequence);
    }

    #[tokio::test]
    async fn resume_is_lossless_across_reconnect() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::with_linger(logs, Duration::from_secs(60)));
        let id = ExecutionId::new();
        bus.open(&id);

        for i in 0..5 {
            bus.publish(&id, entered(&format!("n{i}"))).await.unwrap();
        }

        let mut first = bus.subscribe(&id, 0).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(first.next().await.unwrap().sequence);
        }
        drop(first);

        bus.publish(&id, entered("late")).await.unwrap();

        let mut resumed = bus.subscribe(&id, *seen.last().unwrap()).await.unwrap();
        bus.publish(&id, completed()).await.unwrap();
        while let Some(row) = resumed.next().await {
            seen.push(row.sequence);
            if row.event_type == "execution_completed" {
                break;
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn subscribe_after_terminal_reads_from_log() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::with_linger(logs, Duration::from_millis(1)));
        let id = ExecutionId::new();
        bus.open(&id);
        bus.publish(&id, started()).await.unwrap();
        bus.publish(&id, completed()).await.unwrap();

        // Allow the linger task to reclaim the topic.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bus.next_sequence(&id).await.is_none());

        let mut sub = bus.subscribe(&id, 0).await.unwrap();
        assert!(!sub.is_live());
        assert_eq!(sub.next().await.unwrap().sequence, 1);
        assert_eq!(sub.next().await.unwrap().sequence, 2);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_not_the_execution() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::new(logs));
        let id = ExecutionId::new();
        bus.open(&id);

        let sub = bus.subscribe(&id, 0).await.unwrap();
        // Never drain: overflow the mailbox.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(&id, entered(&format!("n{i}"))).await.unwrap();
        }
        drop(sub);

        // The execution itself kept publishing fine.
        assert_eq!(
            bus.next_sequence(&id).await.unwrap(),
            (SUBSCRIBER_BUFFER + 10) as u64 + 1
        );
    }

    #[tokio::test]
    async fn append_failure_is_retried_once() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::new(logs.clone()));
        let id = ExecutionId::new();
        bus.open(&id);

        logs.fail_next.store(1, Ordering::SeqCst);
        assert_eq!(bus.publish(&id, started()).await.unwrap(), 1);

        // Two consecutive failures kill the publish.
        logs.fail_next.store(2, Ordering::SeqCst);
        assert!(bus.publish(&id, entered("a")).await.is_err());
        // The sequence was not consumed by the failed publish.
        assert_eq!(bus.publish(&id, entered("a")).await.unwrap(), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "publish after terminal event")]
    async fn publish_after_terminal_panics() {
        let logs = MemLogs::new();
        let bus = Arc::new(ExecutionBus::new(logs));
        let id = ExecutionId::new();
        bus.open(&id);
        bus.publish(&id, completed()).await.unwrap();
        let _ = bus.publish(&id, entered("late")).await;
    }
}
