//! Live push channel: transient toasts for `new-*` events.
//!
//! The listener runs beside the poller. By default it never touches the feed
//! or the dedup cache; when configured to, it hands each event to the engine
//! as a one-entity poll result.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use opsfeed_adapters::draft_from_entity;
use opsfeed_core::{now_millis, Category};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::engine::NotificationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushKind {
    #[serde(rename = "new-order")]
    NewOrder,
    #[serde(rename = "new-question")]
    NewQuestion,
    #[serde(rename = "new-review")]
    NewReview,
}

impl PushKind {
    pub const ALL: [PushKind; 3] = [PushKind::NewOrder, PushKind::NewQuestion, PushKind::NewReview];

    pub fn event_name(&self) -> &'static str {
        match self {
            PushKind::NewOrder => "new-order",
            PushKind::NewQuestion => "new-question",
            PushKind::NewReview => "new-review",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_name() == name)
    }

    pub fn category(&self) -> Category {
        match self {
            PushKind::NewOrder => Category::Order,
            PushKind::NewQuestion => Category::Question,
            PushKind::NewReview => Category::Review,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: PushKind,
    pub data: JsonValue,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connecting to push channel: {0}")]
    Connect(String),
    #[error("push channel protocol error: {0}")]
    Protocol(String),
    #[error("push channel closed")]
    Closed,
}

/// Authenticated operator context the listener is bound to.
#[derive(Debug, Clone, Default)]
pub struct OperatorSession {
    pub user_id: String,
    pub token: Option<String>,
    pub roles: Vec<String>,
}

impl OperatorSession {
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

pub type PushStream = BoxStream<'static, Result<PushEvent, ChannelError>>;

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self, session: &OperatorSession) -> Result<PushStream, ChannelError>;
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: JsonValue,
}

/// Decode a text frame. Unknown event names are ignored.
pub fn decode_frame(text: &str) -> Result<Option<PushEvent>, ChannelError> {
    let frame: WireFrame =
        serde_json::from_str(text).map_err(|err| ChannelError::Protocol(err.to_string()))?;
    Ok(PushKind::from_event_name(&frame.event).map(|kind| PushEvent {
        kind,
        data: frame.data,
    }))
}

/// JSON-over-WebSocket push channel.
#[derive(Debug, Clone)]
pub struct WebSocketChannel {
    url: String,
}

impl WebSocketChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushChannel for WebSocketChannel {
    async fn connect(&self, session: &OperatorSession) -> Result<PushStream, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        if let Some(token) = &session.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| ChannelError::Connect(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        info!(url = %self.url, "push channel connected");

        let events = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                    Ok(Some(event)) => Some(Ok(event)),
                    Ok(None) => None,
                    Err(err) => {
                        debug!(error = %err, "ignoring undecodable push frame");
                        None
                    }
                },
                Ok(Message::Close(_)) => Some(Err(ChannelError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(ChannelError::Protocol(err.to_string()))),
            }
        });
        Ok(events.boxed())
    }
}

/// In-process channel backed by a tokio broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<PushEvent>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: PushEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl PushChannel for BroadcastChannel {
    async fn connect(&self, _session: &OperatorSession) -> Result<PushStream, ChannelError> {
        let receiver = self.sender.subscribe();
        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push listener lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub kind: PushKind,
    pub title: String,
    pub message: String,
    pub received_at: i64,
}

impl Toast {
    pub fn for_event(event: &PushEvent, now_ms: i64) -> Self {
        let (title, fallback) = match event.kind {
            PushKind::NewOrder => ("New order", "A new order just arrived"),
            PushKind::NewQuestion => ("New question", "A customer asked a question"),
            PushKind::NewReview => ("New review", "A customer left a review"),
        };
        let message = draft_from_entity(event.kind.category(), &event.data, now_ms)
            .map(|d| d.message)
            .unwrap_or_else(|| fallback.to_string());
        Self {
            kind: event.kind,
            title: title.to_string(),
            message,
            received_at: now_ms,
        }
    }
}

/// Bounded, time-limited set of recent toasts. Never persisted.
#[derive(Debug)]
pub struct ToastBoard {
    capacity: usize,
    ttl: Duration,
    toasts: Mutex<VecDeque<Toast>>,
}

impl Default for ToastBoard {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(8))
    }
}

impl ToastBoard {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            toasts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, toast: Toast) {
        let mut toasts = self.toasts.lock().unwrap_or_else(|e| e.into_inner());
        toasts.push_front(toast);
        toasts.truncate(self.capacity);
    }

    /// Toasts younger than the TTL, newest first.
    pub fn active(&self, now_ms: i64) -> Vec<Toast> {
        let ttl_ms = self.ttl.as_millis() as i64;
        let mut toasts = self.toasts.lock().unwrap_or_else(|e| e.into_inner());
        toasts.retain(|t| now_ms - t.received_at < ttl_ms);
        toasts.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
        }
    }
}

pub struct LiveListener {
    channel: Arc<dyn PushChannel>,
    toasts: Arc<ToastBoard>,
    policy: ReconnectPolicy,
    required_role: String,
    reconcile_into: Option<Arc<NotificationEngine>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveListener {
    pub fn new(
        channel: Arc<dyn PushChannel>,
        toasts: Arc<ToastBoard>,
        policy: ReconnectPolicy,
        required_role: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            toasts,
            policy,
            required_role: required_role.into(),
            reconcile_into: None,
            task: Mutex::new(None),
        }
    }

    /// Route push events through the engine's dedup path as well.
    pub fn reconciling_into(mut self, engine: Arc<NotificationEngine>) -> Self {
        self.reconcile_into = Some(engine);
        self
    }

    /// Subscribe for this session. Returns `false` (and stays unsubscribed)
    /// unless the session is authenticated with the required role.
    pub fn start(&self, session: OperatorSession) -> bool {
        if !session.is_authenticated() || !session.has_role(&self.required_role) {
            debug!(user_id = %session.user_id, "session lacks operator role; live channel not started");
            return false;
        }
        self.stop();

        let channel = Arc::clone(&self.channel);
        let toasts = Arc::clone(&self.toasts);
        let engine = self.reconcile_into.clone();
        let policy = self.policy;
        let handle = tokio::spawn(async move {
            run_listener(channel, toasts, engine, policy, session).await;
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    /// Tear down on logout or unmount.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            debug!("live listener stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for LiveListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_listener(
    channel: Arc<dyn PushChannel>,
    toasts: Arc<ToastBoard>,
    engine: Option<Arc<NotificationEngine>>,
    policy: ReconnectPolicy,
    session: OperatorSession,
) {
    let mut failures = 0usize;
    loop {
        match channel.connect(&session).await {
            Ok(mut events) => {
                while let Some(next) = events.next().await {
                    match next {
                        Ok(event) => {
                            // only a channel that delivers earns a fresh retry budget
                            failures = 0;
                            toasts.push(Toast::for_event(&event, now_millis()));
                            if let Some(engine) = &engine {
                                engine.ingest_push(&event).await;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "push channel dropped");
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, attempt = failures + 1, "push channel connect failed"),
        }

        failures += 1;
        if failures > policy.max_retries {
            warn!(
                retries = policy.max_retries,
                "push channel retries exhausted; continuing with polling only"
            );
            return;
        }
        tokio::time::sleep(policy.delay).await;
    }
}
