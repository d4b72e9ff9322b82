#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use convo_api::{
    ApiError, ConversationId, InMemoryMessageApi, MessageApi, MessageId, MessagePayload,
    PagePayload, PageRequest, SendRequest, UserId,
};
use convo_sync::transport::{Backoff, MockBroker};
use convo_sync::{
    Connection, ConnectionConfig, ConversationStore, StoreConfig, StoreEvent,
    SubscriptionRegistry,
};
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        host: "test".into(),
        token: None,
        heartbeat_interval: Duration::ZERO,
        heartbeat_timeout: Duration::from_millis(500),
        backoff: Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
        },
    }
}

pub fn at(n: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap()
}

/// Message `m{n}` created `n` minutes after a fixed origin.
pub fn payload(conversation: &str, n: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::new(format!("m{n}")),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new("u1"),
        content: Some(format!("message {n}")),
        attachment_url: None,
        attachment_type: None,
        attachment_name: None,
        created_at: at(n),
        status: None,
        kind: None,
    }
}

/// The JSON a broker pushes for `payload`.
pub fn push_body(payload: &MessagePayload) -> String {
    serde_json::to_string(payload).unwrap()
}

pub fn status_push(conversation: &str, n: i64, status: &str) -> String {
    json!({
        "id": format!("m{n}"),
        "conversationId": conversation,
        "senderId": "u1",
        "content": format!("message {n}"),
        "createdAt": at(n).to_rfc3339(),
        "status": status,
    })
    .to_string()
}

pub fn ids(store: &ConversationStore) -> Vec<String> {
    store
        .messages()
        .into_iter()
        .map(|message| message.id.as_str().to_string())
        .collect()
}

/// Polls `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("operation timed out")
}

/// Waits for the next event matching `pick`, skipping the rest.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<StoreEvent>,
    mut pick: impl FnMut(StoreEvent) -> Option<T>,
) -> T {
    within(async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
}

pub async fn next_appended(events: &mut broadcast::Receiver<StoreEvent>) -> String {
    next_event(events, |event| match event {
        StoreEvent::Appended { id } => Some(id.as_str().to_string()),
        _ => None,
    })
    .await
}

/// Wraps [`InMemoryMessageApi`] so a test can hold page fetches in flight.
pub struct GatedApi {
    pub inner: InMemoryMessageApi,
    armed: AtomicBool,
    entered: Notify,
    gate: Semaphore,
    pages: Mutex<Vec<PageRequest>>,
}

impl GatedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryMessageApi::default(),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            gate: Semaphore::new(0),
            pages: Mutex::new(Vec::new()),
        })
    }

    /// Holds every following fetch until [`GatedApi::release`].
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held fetch has started.
    pub async fn entered(&self) {
        within(self.entered.notified()).await
    }

    pub fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.gate.add_permits(64);
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.pages.lock().clone()
    }
}

#[async_trait]
impl MessageApi for GatedApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PagePayload, ApiError> {
        self.pages.lock().push(request.clone());
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ApiError::Unavailable("gate closed".into()))?;
        }
        self.inner.fetch_page(request).await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessagePayload, ApiError> {
        self.inner.send_message(request).await
    }
}

pub struct Harness {
    pub broker: MockBroker,
    pub connection: Connection,
    pub registry: SubscriptionRegistry,
    pub api: Arc<GatedApi>,
    pub store: Arc<ConversationStore>,
}

impl Harness {
    /// A connected stack with `history` seeded for conversation `c1`.
    pub async fn start(history: impl IntoIterator<Item = i64>, page_size: u32) -> Self {
        let broker = MockBroker::new();
        let (connection, frames) = Connection::new(broker.clone(), fast_config());
        let registry = SubscriptionRegistry::spawn(connection.clone(), frames);
        let api = GatedApi::new();
        api.inner
            .seed(
                &ConversationId::new("c1"),
                history.into_iter().map(|n| payload("c1", n)).collect(),
            )
            .await;
        let store = Arc::new(ConversationStore::new(
            api.clone(),
            registry.clone(),
            connection.clone(),
            StoreConfig {
                page_size,
                ..StoreConfig::default()
            },
        ));
        connection.connect();
        within(connection.wait_connected())
            .await
            .expect("connect failed");
        Self {
            broker,
            connection,
            registry,
            api,
            store,
        }
    }

    pub fn topic(&self) -> String {
        StoreConfig::default().topic_for(&ConversationId::new("c1"))
    }

    /// Initializes `c1` and waits until the broker sees the subscription.
    pub async fn initialize(&self) {
        within(self.store.initialize(ConversationId::new("c1")))
            .await
            .expect("initialize failed");
        self.wait_subscribed().await;
    }

    pub async fn wait_subscribed(&self) {
        let topic = self.topic();
        let broker = self.broker.clone();
        eventually("broker subscription", || broker.subscriptions() == [topic.clone()]).await;
    }

    pub fn push(&self, n: i64) -> usize {
        self.broker.publish(&self.topic(), &push_body(&payload("c1", n)))
    }
}
