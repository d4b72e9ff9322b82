//! Per-conversation message state merged from history pages and live pushes.

use crate::subscription::{RegistryError, SubscriptionRegistry};
use crate::transport::Connection;
use convo_api::{
    ApiError, Attachment, ConversationId, Cursor, Message, MessageApi, MessageId,
    MessagePayload, PageRequest, SendRequest,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub mod sequence;

pub use sequence::{Merge, MessageSequence, PageMerge};

pub const DEFAULT_TOPIC_PREFIX: &str = "/topic/conversations";
pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub page_size: u32,
    /// The live topic of a conversation is `{topic_prefix}/{id}`.
    pub topic_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn topic_for(&self, conversation_id: &ConversationId) -> String {
        format!(
            "{}/{}",
            self.topic_prefix.trim_end_matches('/'),
            conversation_id
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Uninitialized,
    LoadingInitial,
    Ready,
    LoadingOlder,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("store is not initialized")]
    NotInitialized,
    #[error("store is busy ({0:?})")]
    Busy(Phase),
    #[error("topic {0} is already subscribed elsewhere")]
    TopicInUse(String),
    #[error("store was torn down before the request finished")]
    TornDown,
    #[error("a message needs text or an attachment")]
    EmptyMessage,
}

/// Changes to the sequence, broadcast to presentation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Loaded { count: usize },
    /// A new newest message.
    Appended { id: MessageId },
    /// A late message that sorted before the newest one.
    Inserted { id: MessageId, index: usize },
    Prepended { count: usize },
    StatusChanged { id: MessageId },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { count: usize, has_more: bool },
    /// Nothing older to fetch, or a load is already in flight.
    Skipped,
}

#[derive(Default)]
struct StoreState {
    phase: Phase,
    conversation: Option<ConversationId>,
    topic: Option<String>,
    messages: MessageSequence,
    cursor: Option<Cursor>,
    has_more: bool,
    /// Bumped by every initialize and teardown; results carrying an older
    /// generation are discarded.
    generation: u64,
}

impl StoreState {
    fn merge(&mut self, message: Message) -> Option<StoreEvent> {
        match self.messages.insert(message) {
            Merge::Inserted(index) => {
                let id = self.messages.get(index)?.id.clone();
                if index + 1 == self.messages.len() {
                    Some(StoreEvent::Appended { id })
                } else {
                    Some(StoreEvent::Inserted { id, index })
                }
            }
            Merge::StatusUpdated(index) => Some(StoreEvent::StatusChanged {
                id: self.messages.get(index)?.id.clone(),
            }),
            Merge::Duplicate => None,
        }
    }

    fn clear(&mut self) -> Option<String> {
        self.generation += 1;
        self.phase = Phase::Uninitialized;
        self.conversation = None;
        self.messages.clear();
        self.cursor = None;
        self.has_more = false;
        self.topic.take()
    }
}

struct Shared {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Shared {
    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status_changes(&self, ids: Vec<MessageId>) {
        for id in ids {
            self.emit(StoreEvent::StatusChanged { id });
        }
    }

    fn on_push(&self, conversation: &ConversationId, generation: u64, payload: Value) {
        let message = match serde_json::from_value::<MessagePayload>(payload) {
            Ok(payload) => payload.normalize(),
            Err(err) => {
                warn!(
                    target = "convo_sync::store",
                    conversation = %conversation,
                    error = %err,
                    "dropping push that is not a message"
                );
                return;
            }
        };
        if message.conversation_id != *conversation {
            debug!(
                target = "convo_sync::store",
                conversation = %conversation,
                other = %message.conversation_id,
                "dropping push for another conversation"
            );
            return;
        }
        let event = {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase == Phase::Uninitialized {
                return;
            }
            state.merge(message)
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }
}

/// Ordered, deduplicated view of one conversation.
///
/// Every merge happens under a single lock scope, so a live push racing a
/// page completion applies either entirely before or entirely after it.
/// Network calls are made without the lock held.
pub struct ConversationStore {
    api: Arc<dyn MessageApi>,
    registry: SubscriptionRegistry,
    connection: Connection,
    config: StoreConfig,
    shared: Arc<Shared>,
}

impl ConversationStore {
    pub fn new(
        api: Arc<dyn MessageApi>,
        registry: SubscriptionRegistry,
        connection: Connection,
        config: StoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            api,
            registry,
            connection,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::default()),
                events,
            }),
        }
    }

    /// Subscribes to the live topic, then merges the most recent page.
    ///
    /// Subscribing first means a message pushed while the page is in flight
    /// is merged rather than lost. On failure the subscription is dropped
    /// and the store returns to uninitialized.
    pub async fn initialize(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        let topic = self.config.topic_for(&conversation_id);
        let generation = {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::Uninitialized {
                return Err(SyncError::Busy(state.phase));
            }
            state.generation += 1;
            state.phase = Phase::LoadingInitial;
            state.conversation = Some(conversation_id.clone());
            state.topic = Some(topic.clone());
            state.generation
        };

        let shared = self.shared.clone();
        let conversation = conversation_id.clone();
        let subscribed = self
            .registry
            .subscribe(&topic, move |payload| {
                shared.on_push(&conversation, generation, payload)
            })
            .await;
        match subscribed {
            Ok(true) => {}
            Ok(false) => {
                self.abandon(generation);
                return Err(SyncError::TopicInUse(topic));
            }
            Err(err) => {
                self.abandon(generation);
                return Err(err.into());
            }
        }

        let request = PageRequest::latest(conversation_id.clone(), Some(self.config.page_size));
        let fetched = self.api.fetch_page(&request).await;
        let page = match fetched {
            Ok(payload) => payload.normalize(),
            Err(err) => {
                warn!(
                    target = "convo_sync::store",
                    conversation = %conversation_id,
                    error = %err,
                    "initial page fetch failed"
                );
                if self.abandon(generation) {
                    let _ = self.registry.unsubscribe(&topic).await;
                }
                return Err(err.into());
            }
        };

        let merged = {
            let mut state = self.shared.state.lock();
            if state.generation != generation {
                return Err(SyncError::TornDown);
            }
            let merged = state.messages.prepend(page.messages);
            state.cursor = page.next_cursor;
            state.has_more = page.has_more;
            state.phase = Phase::Ready;
            merged
        };
        let count = merged.inserted;
        info!(
            target = "convo_sync::store",
            conversation = %conversation_id,
            count,
            has_more = page.has_more,
            "conversation loaded"
        );
        self.shared.emit(StoreEvent::Loaded { count });
        self.shared.emit_status_changes(merged.updated);
        Ok(())
    }

    /// Fetches the page before the stored cursor and merges it at the front.
    pub async fn load_older(&self) -> Result<LoadOutcome, SyncError> {
        let (request, generation, cursor) = {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Uninitialized => return Err(SyncError::NotInitialized),
                Phase::LoadingInitial | Phase::LoadingOlder => return Ok(LoadOutcome::Skipped),
                Phase::Ready => {}
            }
            let (Some(conversation), Some(cursor), true) =
                (state.conversation.clone(), state.cursor.clone(), state.has_more)
            else {
                return Ok(LoadOutcome::Skipped);
            };
            state.phase = Phase::LoadingOlder;
            let request =
                PageRequest::before(conversation, cursor.clone(), Some(self.config.page_size));
            (request, state.generation, cursor)
        };

        let fetched = self.api.fetch_page(&request).await;

        let outcome = {
            let mut state = self.shared.state.lock();
            if state.generation != generation {
                return Err(SyncError::TornDown);
            }
            state.phase = Phase::Ready;
            match fetched {
                Ok(payload) => {
                    let page = payload.normalize();
                    let merged = state.messages.prepend(page.messages);
                    let stalled = page.next_cursor.as_ref() == Some(&cursor);
                    state.has_more = page.has_more && !stalled;
                    state.cursor = if state.has_more { page.next_cursor } else { None };
                    if stalled {
                        warn!(
                            target = "convo_sync::store",
                            cursor = %cursor,
                            "history cursor did not advance; treating history as exhausted"
                        );
                    }
                    Ok((merged, state.has_more))
                }
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok((merged, has_more)) => {
                let count = merged.inserted;
                debug!(
                    target = "convo_sync::store",
                    count,
                    has_more,
                    updated = merged.updated.len(),
                    "older page merged"
                );
                self.shared.emit(StoreEvent::Prepended { count });
                self.shared.emit_status_changes(merged.updated);
                Ok(LoadOutcome::Loaded { count, has_more })
            }
            Err(err) => {
                warn!(
                    target = "convo_sync::store",
                    error = %err,
                    "older page fetch failed"
                );
                Err(err.into())
            }
        }
    }

    /// Sends a message and merges the backend's echo with the push dedup
    /// rule, so the later live delivery of the same message is a no-op.
    pub async fn send(
        &self,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message, SyncError> {
        if content.trim().is_empty() && attachment.is_none() {
            return Err(SyncError::EmptyMessage);
        }
        let (conversation_id, generation) = {
            let state = self.shared.state.lock();
            match (&state.conversation, state.phase) {
                (Some(conversation), phase) if phase != Phase::Uninitialized => {
                    (conversation.clone(), state.generation)
                }
                _ => return Err(SyncError::NotInitialized),
            }
        };

        let request = SendRequest {
            conversation_id,
            content: content.to_string(),
            attachment,
        };
        let message = self.api.send_message(&request).await?.normalize();

        let event = {
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.merge(message.clone())
            } else {
                None
            }
        };
        if let Some(event) = event {
            self.shared.emit(event);
        }
        Ok(message)
    }

    /// Unsubscribes from the live topic and discards the sequence.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        let topic = self.shared.state.lock().clear();
        self.shared.emit(StoreEvent::Cleared);
        if let Some(topic) = topic {
            self.registry.unsubscribe(&topic).await?;
            debug!(target = "convo_sync::store", topic = %topic, "store torn down");
        }
        Ok(())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.state.lock().messages.as_slice().to_vec()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn loading(&self) -> bool {
        self.phase() == Phase::LoadingInitial
    }

    pub fn loading_more(&self) -> bool {
        self.phase() == Phase::LoadingOlder
    }

    pub fn has_more(&self) -> bool {
        self.shared.state.lock().has_more
    }

    pub fn connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.shared.state.lock().conversation.clone()
    }

    pub fn topic(&self) -> Option<String> {
        self.shared.state.lock().topic.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.shared.events.subscribe()
    }

    /// Resets a failed initialize unless a teardown already did. Returns true
    /// when this call performed the reset.
    fn abandon(&self, generation: u64) -> bool {
        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return false;
        }
        state.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_topic_is_derived_from_the_conversation() {
        let config = StoreConfig::default();
        assert_eq!(
            config.topic_for(&ConversationId::new("42")),
            "/topic/conversations/42"
        );
        let config = StoreConfig {
            topic_prefix: "/topic/chat/".into(),
            ..StoreConfig::default()
        };
        assert_eq!(config.topic_for(&ConversationId::new("7")), "/topic/chat/7");
    }
}
