use super::{Handler, RegistryError, SubscriptionInfo, SubscriptionState};
use crate::transport::{Connection, ConnectionStatus, FrameReceiver};
use broker_proto::{Command, Frame};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

enum Request {
    Subscribe {
        topic: String,
        handler: Handler,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
}

/// Handle to the registry task.
///
/// The task is the only writer of the topic map. It watches the connection
/// status and replays every entry whenever a new broker session comes up, so
/// a subscription survives any number of reconnects with its original
/// handler. An explicit disconnect tears every entry down.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    requests: mpsc::UnboundedSender<Request>,
}

impl SubscriptionRegistry {
    pub fn spawn(connection: Connection, frames: FrameReceiver) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let status = connection.watch();
        let task = RegistryTask {
            connection,
            entries: HashMap::new(),
            topics_by_id: HashMap::new(),
            next_id: 0,
            session: None,
        };
        tokio::spawn(task.run(rx, frames, status));
        Self { requests }
    }

    /// Registers `handler` for `topic`. Returns false, leaving the existing
    /// entry and its handler untouched, when the topic is already registered.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<bool, RegistryError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let (reply, created) = oneshot::channel();
        self.request(Request::Subscribe {
            topic: topic.to_string(),
            handler: Arc::new(handler),
            reply,
        })?;
        created.await.map_err(|_| RegistryError::Closed)
    }

    /// Returns false when nothing was registered for `topic`.
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool, RegistryError> {
        let (reply, removed) = oneshot::channel();
        self.request(Request::Unsubscribe {
            topic: topic.to_string(),
            reply,
        })?;
        removed.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionInfo>, RegistryError> {
        let (reply, listed) = oneshot::channel();
        self.request(Request::List { reply })?;
        listed.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn state(&self, topic: &str) -> Result<Option<SubscriptionState>, RegistryError> {
        Ok(self
            .subscriptions()
            .await?
            .into_iter()
            .find(|info| info.topic == topic)
            .map(|info| info.state))
    }

    fn request(&self, request: Request) -> Result<(), RegistryError> {
        self.requests.send(request).map_err(|_| RegistryError::Closed)
    }
}

struct Entry {
    id: String,
    handler: Handler,
    state: SubscriptionState,
}

struct RegistryTask {
    connection: Connection,
    entries: HashMap<String, Entry>,
    topics_by_id: HashMap<String, String>,
    next_id: u64,
    /// Broker session the entries were last issued on.
    session: Option<u64>,
}

impl RegistryTask {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut frames: FrameReceiver,
        mut status: watch::Receiver<ConnectionStatus>,
    ) {
        let mut seen = *status.borrow_and_update();
        if seen.is_connected() {
            self.session = Some(seen.session);
        }
        let mut frames_open = true;
        let mut status_open = true;

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                frame = frames.recv(), if frames_open => match frame {
                    Some(frame) => self.route(frame),
                    None => frames_open = false,
                },
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let next = *status.borrow_and_update();
                    self.on_status(seen, next).await;
                    seen = next;
                }
            }
        }
        debug!(target = "convo_sync::subscription", "registry task finished");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let created = self.subscribe(topic, handler).await;
                let _ = reply.send(created);
            }
            Request::Unsubscribe { topic, reply } => {
                let removed = self.unsubscribe(&topic).await;
                let _ = reply.send(removed);
            }
            Request::List { reply } => {
                let mut listed: Vec<SubscriptionInfo> = self
                    .entries
                    .iter()
                    .map(|(topic, entry)| SubscriptionInfo {
                        id: entry.id.clone(),
                        topic: topic.clone(),
                        state: entry.state,
                    })
                    .collect();
                listed.sort_by(|a, b| a.topic.cmp(&b.topic));
                let _ = reply.send(listed);
            }
        }
    }

    async fn subscribe(&mut self, topic: String, handler: Handler) -> bool {
        if self.entries.contains_key(&topic) {
            debug!(
                target = "convo_sync::subscription",
                topic = %topic,
                "topic already registered; ignoring subscribe"
            );
            return false;
        }
        let id = format!("sub-{}", self.next_id);
        self.next_id += 1;
        self.topics_by_id.insert(id.clone(), topic.clone());
        self.entries.insert(
            topic.clone(),
            Entry {
                id,
                handler,
                state: SubscriptionState::Pending,
            },
        );
        if self.session.is_some() {
            self.issue(&topic).await;
        } else {
            debug!(
                target = "convo_sync::subscription",
                topic = %topic,
                "not connected; subscription held pending"
            );
        }
        true
    }

    async fn unsubscribe(&mut self, topic: &str) -> bool {
        let Some(entry) = self.entries.remove(topic) else {
            return false;
        };
        self.topics_by_id.remove(&entry.id);
        if entry.state == SubscriptionState::Active && self.session.is_some() {
            if let Err(err) = self.connection.send(Frame::unsubscribe(&entry.id)).await {
                debug!(
                    target = "convo_sync::subscription",
                    topic = %topic,
                    error = %err,
                    "unsubscribe not delivered"
                );
            }
        }
        info!(
            target = "convo_sync::subscription",
            topic = %topic,
            id = %entry.id,
            state = %SubscriptionState::TornDown,
            "subscription removed"
        );
        true
    }

    /// Sends SUBSCRIBE for `topic` on the current session.
    async fn issue(&mut self, topic: &str) {
        let Some(id) = self.entries.get(topic).map(|entry| entry.id.clone()) else {
            return;
        };
        match self.connection.send(Frame::subscribe(&id, topic)).await {
            Ok(()) => {
                if let Some(entry) = self.entries.get_mut(topic) {
                    entry.state = SubscriptionState::Active;
                }
                info!(
                    target = "convo_sync::subscription",
                    topic = %topic,
                    id = %id,
                    "subscription active"
                );
            }
            Err(err) => warn!(
                target = "convo_sync::subscription",
                topic = %topic,
                error = %err,
                "subscribe failed; retrying on next session"
            ),
        }
    }

    async fn on_status(&mut self, previous: ConnectionStatus, next: ConnectionStatus) {
        if next.stopped && !previous.stopped {
            self.session = None;
            self.tear_down_all();
            return;
        }
        if next.is_connected() {
            if self.session == Some(next.session) {
                return;
            }
            self.session = Some(next.session);
            let mut topics: Vec<String> = self.entries.keys().cloned().collect();
            topics.sort();
            if !topics.is_empty() {
                info!(
                    target = "convo_sync::subscription",
                    session = next.session,
                    count = topics.len(),
                    "replaying subscriptions"
                );
            }
            for topic in topics {
                if let Some(entry) = self.entries.get_mut(&topic) {
                    entry.state = SubscriptionState::Pending;
                }
                self.issue(&topic).await;
            }
        } else if self.session.take().is_some() {
            for entry in self.entries.values_mut() {
                entry.state = SubscriptionState::Pending;
            }
        }
    }

    fn tear_down_all(&mut self) {
        for (topic, entry) in self.entries.drain() {
            debug!(
                target = "convo_sync::subscription",
                topic = %topic,
                id = %entry.id,
                "subscription torn down by disconnect"
            );
        }
        self.topics_by_id.clear();
    }

    fn route(&self, frame: Frame) {
        if frame.command == Command::Receipt {
            trace!(target = "convo_sync::subscription", "receipt received");
            return;
        }
        let Some(topic) = frame
            .subscription()
            .and_then(|id| self.topics_by_id.get(id))
        else {
            debug!(
                target = "convo_sync::subscription",
                subscription = ?frame.subscription(),
                "message for unknown subscription dropped"
            );
            return;
        };
        let Some(entry) = self.entries.get(topic) else {
            return;
        };
        match serde_json::from_str::<Value>(&frame.body) {
            Ok(payload) => (entry.handler)(payload),
            Err(err) => warn!(
                target = "convo_sync::subscription",
                topic = %topic,
                error = %err,
                "dropping malformed payload"
            ),
        }
    }
}
