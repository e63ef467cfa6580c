//! Per-user turn serialization.
//!
//! At most one conversational turn is in flight per user at any time.
//! Further turns wait in a small bounded backlog; anything beyond the cap is
//! rejected with a notice instead of growing the queue. While a turn runs,
//! the user sees a periodic "still working" indicator; on completion the
//! result is recorded and delivered, and the next queued turn (if any)
//! starts.

use crate::error::{Error, Result};
use crate::outbound::ChannelDelivery;
use crate::store::{MessageRole, Store};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Cadence of the "still working" side-effect during a turn.
const TYPING_REFRESH: Duration = Duration::from_secs(20);

/// Carries one turn to a sandbox and returns the terminal response.
///
/// Implemented by the gateway [`ConnectionRegistry`](crate::gateway::ConnectionRegistry);
/// a seam here keeps queue ordering testable without a live channel.
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Ensure a connection, dispatch the turn, await the terminal event.
    async fn run_turn(
        &self,
        sandbox_id: &str,
        port: u16,
        container_id: Option<&str>,
        text: &str,
        timeout: Duration,
    ) -> Result<String>;
}

/// Where a queued turn must be dispatched.
#[derive(Debug, Clone)]
pub struct SandboxRef {
    /// Target sandbox
    pub sandbox_id: String,
    /// Host port of its gateway
    pub port: u16,
    /// Container reference for pairing recovery
    pub container_id: Option<String>,
    /// Channel address for replies and notices
    pub phone: String,
}

/// One user turn waiting to be processed.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// The user's text
    pub text: String,
    /// Channel message id (read receipts, typing indicator anchor)
    pub external_message_id: String,
}

struct UserLane {
    backlog: VecDeque<TurnRequest>,
    processing: bool,
}

struct QueueInner {
    lanes: Mutex<HashMap<String, UserLane>>,
    transport: Arc<dyn TurnTransport>,
    delivery: Arc<dyn ChannelDelivery>,
    store: Store,
    turn_timeout: Duration,
    max_depth: usize,
}

/// Per-user FIFO turn queue with a bounded backlog.
#[derive(Clone)]
pub struct TurnQueue {
    inner: Arc<QueueInner>,
}

impl TurnQueue {
    /// Queue over the given transport and channel adapter.
    pub fn new(
        transport: Arc<dyn TurnTransport>,
        delivery: Arc<dyn ChannelDelivery>,
        store: Store,
        turn_timeout: Duration,
        max_depth: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                lanes: Mutex::new(HashMap::new()),
                transport,
                delivery,
                store,
                turn_timeout,
                max_depth,
            }),
        }
    }

    /// Submit a turn for a user. Starts immediately when the user has
    /// nothing in flight; otherwise queues (with a notice) up to the depth
    /// cap, beyond which the turn is dropped with a rejection notice.
    pub async fn submit(&self, user_id: &str, sandbox: SandboxRef, request: TurnRequest) {
        let mut lanes = self.inner.lanes.lock().await;
        let lane = lanes.entry(user_id.to_string()).or_insert_with(|| UserLane {
            backlog: VecDeque::new(),
            processing: false,
        });

        if lane.processing {
            if lane.backlog.len() >= self.inner.max_depth {
                drop(lanes);
                warn!(user_id, "Turn backlog full, rejecting");
                self.notify(&sandbox.phone, &Error::QueueFull.user_notice())
                    .await;
                return;
            }
            lane.backlog.push_back(request);
            let depth = lane.backlog.len();
            drop(lanes);
            debug!(user_id, depth, "Turn queued behind an in-flight turn");
            self.notify(
                &sandbox.phone,
                "Your message is queued and will be processed shortly.",
            )
            .await;
            return;
        }

        lane.processing = true;
        drop(lanes);

        let queue = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            queue.drain_lane(user_id, sandbox, request).await;
        });
    }

    /// Backlog length for a user (not counting the in-flight turn).
    pub async fn backlog_len(&self, user_id: &str) -> usize {
        let lanes = self.inner.lanes.lock().await;
        lanes.get(user_id).map(|l| l.backlog.len()).unwrap_or(0)
    }

    /// Whether a turn is currently in flight for a user.
    pub async fn is_processing(&self, user_id: &str) -> bool {
        let lanes = self.inner.lanes.lock().await;
        lanes.get(user_id).map(|l| l.processing).unwrap_or(false)
    }

    /// Run the given turn, then drain the backlog, then clear the flag.
    async fn drain_lane(&self, user_id: String, sandbox: SandboxRef, first: TurnRequest) {
        let mut next = Some(first);
        while let Some(request) = next {
            self.process(&sandbox, request).await;

            let mut lanes = self.inner.lanes.lock().await;
            match lanes.get_mut(&user_id) {
                Some(lane) => {
                    next = lane.backlog.pop_front();
                    if next.is_none() {
                        lane.processing = false;
                    }
                }
                None => next = None,
            }
        }
        info!(user_id, "Turn lane drained");
    }

    /// One turn: success delivers the response, failure delivers a notice.
    /// Neither aborts the lane.
    async fn process(&self, sandbox: &SandboxRef, request: TurnRequest) {
        match self.process_inner(sandbox, &request).await {
            Ok(response) => {
                if let Err(e) = self.inner.delivery.send_text(&sandbox.phone, &response).await {
                    error!(sandbox_id = %sandbox.sandbox_id, error = %e, "Response delivery failed");
                }
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.sandbox_id, error = %e, "Turn failed");
                self.notify(&sandbox.phone, &e.user_notice()).await;
            }
        }
    }

    async fn process_inner(&self, sandbox: &SandboxRef, request: &TurnRequest) -> Result<String> {
        let typing = self.spawn_typing(sandbox, request);

        let recorded = self
            .inner
            .store
            .record_message(
                &sandbox.sandbox_id,
                MessageRole::User,
                &request.text,
                "sent",
                "channel",
            )
            .await;
        if let Err(e) = recorded {
            typing.abort();
            return Err(e);
        }

        let result = self
            .inner
            .transport
            .run_turn(
                &sandbox.sandbox_id,
                sandbox.port,
                sandbox.container_id.as_deref(),
                &request.text,
                self.inner.turn_timeout,
            )
            .await;
        typing.abort();
        let response = result?;

        self.inner
            .store
            .record_message(
                &sandbox.sandbox_id,
                MessageRole::Assistant,
                &response,
                "complete",
                "channel",
            )
            .await?;
        Ok(response)
    }

    /// Fire the typing indicator now and on a cadence until aborted.
    fn spawn_typing(
        &self,
        sandbox: &SandboxRef,
        request: &TurnRequest,
    ) -> tokio::task::JoinHandle<()> {
        let delivery = self.inner.delivery.clone();
        let phone = sandbox.phone.clone();
        let reply_to = request.external_message_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TYPING_REFRESH);
            loop {
                ticker.tick().await;
                if let Err(e) = delivery.typing(&phone, &reply_to).await {
                    debug!(error = %e, "Typing indicator failed");
                }
            }
        })
    }

    async fn notify(&self, phone: &str, text: &str) {
        if let Err(e) = self.inner.delivery.send_text(phone, text).await {
            error!(error = %e, "Could not deliver notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport {
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TurnTransport for FakeTransport {
        async fn run_turn(
            &self,
            _sandbox_id: &str,
            _port: u16,
            _container_id: Option<&str>,
            text: &str,
            _timeout: Duration,
        ) -> Result<String> {
            self.log.lock().await.push(format!("start:{}", text));
            tokio::time::sleep(self.delay).await;
            self.log.lock().await.push(format!("end:{}", text));
            if self.fail {
                Err(Error::TurnRejected("agent busy".to_string()))
            } else {
                Ok(format!("echo:{}", text))
            }
        }
    }

    struct RecordingDelivery {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ChannelDelivery for RecordingDelivery {
        async fn send_text(&self, _phone: &str, text: &str) -> Result<()> {
            self.sent.lock().await.push(text.to_string());
            Ok(())
        }
        async fn typing(&self, _phone: &str, _reply_to: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_read(&self, _message_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn sandbox_ref() -> SandboxRef {
        SandboxRef {
            sandbox_id: "sb-1".to_string(),
            port: 30001,
            container_id: None,
            phone: "+1555".to_string(),
        }
    }

    fn request(text: &str) -> TurnRequest {
        TurnRequest {
            text: text.to_string(),
            external_message_id: format!("wamid-{}", text),
        }
    }

    async fn build(
        delay: Duration,
        fail: bool,
    ) -> (TurnQueue, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(FakeTransport {
            delay,
            fail,
            log: log.clone(),
        });
        let delivery = Arc::new(RecordingDelivery { sent: sent.clone() });
        let store = Store::in_memory().await.unwrap();
        let queue = TurnQueue::new(transport, delivery, store, Duration::from_secs(5), 3);
        (queue, log, sent)
    }

    #[tokio::test]
    async fn turns_for_one_user_are_serialized() {
        let (queue, log, sent) = build(Duration::from_millis(50), false).await;

        for text in ["a", "b", "c"] {
            queue.submit("u1", sandbox_ref(), request(text)).await;
        }
        while queue.is_processing("u1").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let log = log.lock().await.clone();
        assert_eq!(
            log,
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );

        let sent = sent.lock().await.clone();
        let echoes: Vec<&String> = sent.iter().filter(|t| t.starts_with("echo:")).collect();
        assert_eq!(echoes, ["echo:a", "echo:b", "echo:c"]);
        // Two turns were queued behind the first and announced as such.
        assert_eq!(sent.iter().filter(|t| t.contains("queued")).count(), 2);
    }

    #[tokio::test]
    async fn fourth_queued_turn_is_rejected() {
        let (queue, _log, sent) = build(Duration::from_millis(400), false).await;

        queue.submit("u1", sandbox_ref(), request("busy")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        for text in ["q1", "q2", "q3"] {
            queue.submit("u1", sandbox_ref(), request(text)).await;
        }
        assert_eq!(queue.backlog_len("u1").await, 3);

        queue.submit("u1", sandbox_ref(), request("overflow")).await;
        assert_eq!(queue.backlog_len("u1").await, 3);

        let sent = sent.lock().await.clone();
        assert!(sent.iter().any(|t| t.contains("too many messages")));

        while queue.is_processing("u1").await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn users_do_not_block_each_other() {
        let (queue, log, _sent) = build(Duration::from_millis(100), false).await;

        queue.submit("u1", sandbox_ref(), request("one")).await;
        queue.submit("u2", sandbox_ref(), request("two")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both started before either finished.
        let snapshot = log.lock().await.clone();
        assert!(snapshot.contains(&"start:one".to_string()));
        assert!(snapshot.contains(&"start:two".to_string()));

        while queue.is_processing("u1").await || queue.is_processing("u2").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn failed_turn_yields_a_notice_and_frees_the_lane() {
        let (queue, _log, sent) = build(Duration::from_millis(10), true).await;

        queue.submit("u1", sandbox_ref(), request("doomed")).await;
        while queue.is_processing("u1").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let sent = sent.lock().await.clone();
        assert!(sent.iter().any(|t| t.contains("agent busy")));
        assert!(!queue.is_processing("u1").await);
    }
}
