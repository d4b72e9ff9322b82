use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::model::{
    Attachment, ConversationId, Cursor, Direction, MessageId, MessagePayload, PagePayload, UserId,
};
use crate::ApiError;

/// Arguments for one history request. No cursor means "most recent page".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: ConversationId,
    pub cursor: Option<Cursor>,
    pub limit: Option<u32>,
    pub direction: Direction,
}

impl PageRequest {
    pub fn latest(conversation_id: ConversationId, limit: Option<u32>) -> Self {
        Self {
            conversation_id,
            cursor: None,
            limit,
            direction: Direction::Before,
        }
    }

    pub fn before(conversation_id: ConversationId, cursor: Cursor, limit: Option<u32>) -> Self {
        Self {
            conversation_id,
            cursor: Some(cursor),
            limit,
            direction: Direction::Before,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub attachment: Option<Attachment>,
}

/// The REST surface the sync engine consumes.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PagePayload, ApiError>;

    /// Returns the message as persisted by the backend.
    async fn send_message(&self, request: &SendRequest) -> Result<MessagePayload, ApiError>;
}

const DEFAULT_PAGE_SIZE: usize = 20;

/// In-memory backend for tests and offline wiring.
///
/// Cursors are stringified indices into the conversation's history.
#[derive(Default)]
pub struct InMemoryMessageApi {
    conversations: Mutex<HashMap<ConversationId, Vec<MessagePayload>>>,
    next_id: AtomicU64,
    failures: AtomicUsize,
    requests: AtomicUsize,
}

impl InMemoryMessageApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends history, keeping it sorted by creation time.
    pub async fn seed(&self, conversation_id: &ConversationId, messages: Vec<MessagePayload>) {
        let mut guard = self.conversations.lock().await;
        let history = guard.entry(conversation_id.clone()).or_default();
        history.extend(messages);
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    }

    /// Makes the next `count` requests fail with [`ApiError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total requests served, failed ones included.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), ApiError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match injected {
            Ok(_) => Err(ApiError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

fn parse_cursor(cursor: &Cursor) -> Result<usize, ApiError> {
    cursor
        .as_str()
        .parse()
        .map_err(|_| ApiError::InvalidCursor(cursor.clone()))
}

#[async_trait]
impl MessageApi for InMemoryMessageApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PagePayload, ApiError> {
        self.check_failure()?;
        let guard = self.conversations.lock().await;
        let history = guard
            .get(&request.conversation_id)
            .ok_or_else(|| ApiError::UnknownConversation(request.conversation_id.clone()))?;
        let limit = request
            .limit
            .map(|limit| limit.max(1) as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let (start, end, next) = match request.direction {
            Direction::Before => {
                let end = match &request.cursor {
                    Some(cursor) => parse_cursor(cursor)?.min(history.len()),
                    None => history.len(),
                };
                let start = end.saturating_sub(limit);
                (start, end, (start > 0).then_some(start))
            }
            Direction::After => {
                let start = match &request.cursor {
                    Some(cursor) => parse_cursor(cursor)?.min(history.len()),
                    None => 0,
                };
                let end = (start + limit).min(history.len());
                (start, end, (end < history.len()).then_some(end))
            }
        };

        Ok(PagePayload {
            messages: history[start..end].to_vec(),
            next_cursor: next.map(|index| Cursor::new(index.to_string())),
            has_more: next.is_some(),
        })
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessagePayload, ApiError> {
        self.check_failure()?;
        let mut guard = self.conversations.lock().await;
        let history = guard.entry(request.conversation_id.clone()).or_default();
        let now = Utc::now();
        let created_at = match history.last() {
            Some(last) if last.created_at >= now => last.created_at + Duration::milliseconds(1),
            _ => now,
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = MessagePayload {
            id: MessageId::new(format!("srv-{id}")),
            conversation_id: request.conversation_id.clone(),
            sender_id: UserId::new("me"),
            content: Some(request.content.clone()),
            attachment_url: request.attachment.as_ref().map(|a| a.url.clone()),
            attachment_type: request.attachment.as_ref().map(|a| a.content_type.clone()),
            attachment_name: request.attachment.as_ref().map(|a| a.filename.clone()),
            created_at,
            status: None,
            kind: None,
        };
        history.push(message.clone());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(conversation: &ConversationId, n: i64) -> MessagePayload {
        MessagePayload {
            id: MessageId::new(format!("m{n}")),
            conversation_id: conversation.clone(),
            sender_id: UserId::new("u1"),
            content: Some(format!("message {n}")),
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap(),
            status: None,
            kind: None,
        }
    }

    #[tokio::test]
    async fn pages_backwards_until_exhausted() {
        let api = InMemoryMessageApi::new();
        let conversation = ConversationId::new("c1");
        api.seed(&conversation, (1..=5).map(|n| message(&conversation, n)).collect())
            .await;

        let first = api
            .fetch_page(&PageRequest::latest(conversation.clone(), Some(2)))
            .await
            .unwrap();
        let ids: Vec<_> = first.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m4", "m5"]);
        assert!(first.has_more);

        let second = api
            .fetch_page(&PageRequest::before(
                conversation.clone(),
                first.next_cursor.unwrap(),
                Some(2),
            ))
            .await
            .unwrap();
        let ids: Vec<_> = second.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m3"]);

        let last = api
            .fetch_page(&PageRequest::before(
                conversation.clone(),
                second.next_cursor.unwrap(),
                Some(2),
            ))
            .await
            .unwrap();
        assert_eq!(last.messages.len(), 1);
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let api = InMemoryMessageApi::new();
        let conversation = ConversationId::new("c1");
        api.seed(&conversation, vec![message(&conversation, 1)]).await;
        api.fail_next(1);

        let request = PageRequest::latest(conversation, None);
        assert!(matches!(
            api.fetch_page(&request).await,
            Err(ApiError::Unavailable(_))
        ));
        assert!(api.fetch_page(&request).await.is_ok());
        assert_eq!(api.request_count(), 2);
    }

    #[tokio::test]
    async fn sent_messages_sort_after_history() {
        let api = InMemoryMessageApi::new();
        let conversation = ConversationId::new("c1");
        api.seed(&conversation, vec![message(&conversation, 1)]).await;
        let sent = api
            .send_message(&SendRequest {
                conversation_id: conversation.clone(),
                content: "hello".into(),
                attachment: None,
            })
            .await
            .unwrap();
        let page = api
            .fetch_page(&PageRequest::latest(conversation, None))
            .await
            .unwrap();
        assert_eq!(page.messages.last().map(|m| &m.id), Some(&sent.id));
    }
}
