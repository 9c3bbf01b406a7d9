use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use super::api::SharedState;
use super::models::DeploymentId;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event types ──────────────────────────────────────────────────────

/// Live progress of one deployment, as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// A step is about to run.
    Step { step: String },
    /// A chunk of stdout or stderr from the running command.
    Output { data: String },
    /// Terminal success with the parsed terraform outputs.
    Complete { outputs: serde_json::Value },
    /// Terminal failure.
    Error { error: String },
}

impl DeploymentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

// ── Broadcaster ──────────────────────────────────────────────────────

struct Subscriber {
    deployment_id: DeploymentId,
    tx: mpsc::Sender<String>,
}

/// Fans deployment events out to the subscribers tagged with that
/// deployment. Publishing never blocks: a subscriber whose queue is full
/// is dropped instead of silently missing events, so its stream ends and
/// the client falls back to the status query. Closed subscribers are
/// pruned. Nothing is buffered for subscribers that connect later.
pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Broadcaster {
    /// `buffer` is the per-subscriber queue depth.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber for `deployment_id`. Dropping the returned
    /// [`Subscription`] unregisters it.
    pub fn subscribe(self: &Arc<Self>, deployment_id: DeploymentId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers()
            .insert(id, Subscriber { deployment_id, tx });
        tracing::debug!(%deployment_id, subscriber = id, "Subscriber connected");
        Subscription {
            id,
            deployment_id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        if self.subscribers().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "Subscriber disconnected");
        }
    }

    /// Number of live subscribers for `deployment_id`.
    pub fn subscriber_count(&self, deployment_id: &DeploymentId) -> usize {
        self.subscribers()
            .values()
            .filter(|s| s.deployment_id == *deployment_id)
            .count()
    }

    /// Deliver `event` to every subscriber of `deployment_id`. Returns how
    /// many subscribers accepted it. Subscribers that could not take the
    /// event are unregistered.
    pub fn publish(&self, deployment_id: &DeploymentId, event: &DeploymentEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(%deployment_id, error = %e, "Failed to serialize deployment event");
                return 0;
            }
        };

        let mut subscribers = self.subscribers();
        let mut delivered = 0;
        subscribers.retain(|id, sub| {
            if sub.deployment_id != *deployment_id {
                return true;
            }
            match sub.tx.try_send(json.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(%deployment_id, subscriber = id, "Subscriber queue full, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }
}

/// Receiving end of one subscriber.
pub struct Subscription {
    id: u64,
    deployment_id: DeploymentId,
    rx: mpsc::Receiver<String>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn deployment_id(&self) -> DeploymentId {
        self.deployment_id
    }

    /// Next serialized event. `None` once the subscriber was dropped from
    /// the broadcaster.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next serialized event if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

/// `GET /ws/{id}`: live event stream for one deployment.
///
/// The route key is validated before anything else. A malformed or unknown
/// id still completes the upgrade but is closed straight away with a 1008
/// (policy violation) close frame.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(raw_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let target = match raw_id.parse::<DeploymentId>() {
        Ok(id) => {
            let known = state
                .registry
                .with_lock(&id, |locked| locked.deployment().is_some())
                .await;
            if known == Some(true) {
                Ok(id)
            } else {
                tracing::debug!(deployment_id = %id, "WebSocket for unknown deployment rejected");
                Err("Deployment not found")
            }
        }
        Err(_) => {
            tracing::debug!(route_key = %raw_id, "WebSocket with invalid deployment id rejected");
            Err("Invalid deployment ID")
        }
    };

    ws.on_upgrade(move |socket| async move {
        match target {
            Ok(id) => handle_socket(socket, state, id).await,
            Err(reason) => reject(socket, reason).await,
        }
    })
}

async fn reject(mut socket: WebSocket, reason: &'static str) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn handle_socket(socket: WebSocket, state: SharedState, id: DeploymentId) {
    let (sender, receiver) = socket.split();
    let subscription = state.broadcaster.subscribe(id);
    run_socket_loop(sender, receiver, subscription).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards the subscription's events, watches client frames, and pings
/// periodically. If no Pong arrives within [`PONG_TIMEOUT`] after a Ping,
/// the connection is considered dead and the loop exits. Leaving the loop
/// drops the subscription, which unregisters it.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(deployment_id = %subscription.deployment_id(), "Pong timeout, closing socket");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Event forwarding ────────────────────────────────────
            event = subscription.recv() => {
                match event {
                    Some(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(json: &str) -> serde_json::Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_event_wire_format() {
        let cases = [
            (
                DeploymentEvent::Step {
                    step: "Initializing Terraform...".into(),
                },
                json!({"type": "step", "step": "Initializing Terraform..."}),
            ),
            (
                DeploymentEvent::Output {
                    data: "Plan: 3 to add".into(),
                },
                json!({"type": "output", "data": "Plan: 3 to add"}),
            ),
            (
                DeploymentEvent::Complete {
                    outputs: json!({"app_id": {"value": "abc"}}),
                },
                json!({"type": "complete", "outputs": {"app_id": {"value": "abc"}}}),
            ),
            (
                DeploymentEvent::Error {
                    error: "Command failed with code 1: boom".into(),
                },
                json!({"type": "error", "error": "Command failed with code 1: boom"}),
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(serde_json::to_value(&event).unwrap(), expected);
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(DeploymentEvent::Complete { outputs: json!({}) }.is_terminal());
        assert!(DeploymentEvent::Error { error: "x".into() }.is_terminal());
        assert!(!DeploymentEvent::Step { step: "x".into() }.is_terminal());
        assert!(!DeploymentEvent::Output { data: "x".into() }.is_terminal());
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_subscribers() {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let a = DeploymentId::new();
        let b = DeploymentId::new();
        let mut sub_a1 = broadcaster.subscribe(a);
        let mut sub_a2 = broadcaster.subscribe(a);
        let mut sub_b = broadcaster.subscribe(b);

        let delivered = broadcaster.publish(&a, &DeploymentEvent::Step { step: "A".into() });
        assert_eq!(delivered, 2);

        assert_eq!(parse(&sub_a1.recv().await.unwrap())["step"], "A");
        assert_eq!(parse(&sub_a2.recv().await.unwrap())["step"], "A");
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_interleaved_publication_stays_isolated() {
        let broadcaster = Arc::new(Broadcaster::new(64));
        let a = DeploymentId::new();
        let b = DeploymentId::new();
        let mut sub_a = broadcaster.subscribe(a);
        let mut sub_b = broadcaster.subscribe(b);

        for i in 0..10 {
            broadcaster.publish(&a, &DeploymentEvent::Output { data: format!("a{i}") });
            broadcaster.publish(&b, &DeploymentEvent::Output { data: format!("b{i}") });
        }

        for i in 0..10 {
            assert_eq!(parse(&sub_a.recv().await.unwrap())["data"], format!("a{i}"));
            assert_eq!(parse(&sub_b.recv().await.unwrap())["data"], format!("b{i}"));
        }
        assert!(sub_a.try_recv().is_none());
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let id = DeploymentId::new();
        assert_eq!(
            broadcaster.publish(&id, &DeploymentEvent::Step { step: "early".into() }),
            0
        );
        let mut late = broadcaster.subscribe(id);
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let id = DeploymentId::new();
        let sub = broadcaster.subscribe(id);
        assert_eq!(broadcaster.subscriber_count(&id), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(&id), 0);
        assert_eq!(
            broadcaster.publish(&id, &DeploymentEvent::Output { data: "x".into() }),
            0
        );
    }

    #[tokio::test]
    async fn test_full_subscriber_is_disconnected_without_blocking_others() {
        let broadcaster = Arc::new(Broadcaster::new(1));
        let id = DeploymentId::new();
        let mut slow = broadcaster.subscribe(id);
        let mut fast = broadcaster.subscribe(id);

        broadcaster.publish(&id, &DeploymentEvent::Output { data: "1".into() });
        assert_eq!(parse(&fast.recv().await.unwrap())["data"], "1");

        // `slow` still holds event 1, so it is cut off at event 2.
        let delivered = broadcaster.publish(&id, &DeploymentEvent::Output { data: "2".into() });
        assert_eq!(delivered, 1);
        assert_eq!(parse(&fast.recv().await.unwrap())["data"], "2");
        assert_eq!(broadcaster.subscriber_count(&id), 1);

        assert_eq!(parse(&slow.recv().await.unwrap())["data"], "1");
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_stream_ends_instead_of_missing_terminal_event() {
        let broadcaster = Arc::new(Broadcaster::new(2));
        let id = DeploymentId::new();
        let mut sub = broadcaster.subscribe(id);

        broadcaster.publish(&id, &DeploymentEvent::Output { data: "1".into() });
        broadcaster.publish(&id, &DeploymentEvent::Output { data: "2".into() });
        let delivered = broadcaster.publish(&id, &DeploymentEvent::Error { error: "boom".into() });
        assert_eq!(delivered, 0);
        assert_eq!(broadcaster.subscriber_count(&id), 0);

        let mut received = Vec::new();
        while let Some(json) = sub.recv().await {
            received.push(parse(&json));
        }
        assert_eq!(
            received,
            vec![
                json!({"type": "output", "data": "1"}),
                json!({"type": "output", "data": "2"}),
            ]
        );
    }
}
