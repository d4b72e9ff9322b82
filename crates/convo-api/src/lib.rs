//! Asynchronous client for the conversation REST endpoints.
//!
//! Consumed by the sync engine for history pages and outbound messages. The
//! [`MessageApi`] trait is the seam; [`HttpMessageApi`] talks to the real
//! backend and [`InMemoryMessageApi`] stands in for it in tests.

pub mod api;
pub mod model;

pub use api::{InMemoryMessageApi, MessageApi, PageRequest, SendRequest};
pub use model::{
    Attachment, Conversation, ConversationId, Cursor, Direction, Message, MessageId, MessageKind,
    MessagePayload, MessageStatus, Page, PagePayload, UserId,
};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error("invalid cursor {0}")]
    InvalidCursor(Cursor),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone)]
pub struct HttpMessageApi {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_name: Option<&'a str>,
}

impl HttpMessageApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, ApiError> {
        let url = format!("{}/conversations/{}", self.base_url, conversation_id);
        let res = self.authorize(self.http.get(url)).send().await?;
        expect_json(res).await
    }

    fn messages_url(&self, conversation_id: &ConversationId) -> String {
        format!("{}/conversations/{}/messages", self.base_url, conversation_id)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn expect_json<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(ApiError::UnexpectedStatus { status, body })
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PagePayload, ApiError> {
        let mut query: Vec<(&str, String)> =
            vec![("direction", request.direction.as_str().to_string())];
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.to_string()));
        }
        if let Some(limit) = request.limit {
            query.push(("limit", limit.to_string()));
        }

        debug!(
            target = "convo_api::http",
            conversation = %request.conversation_id,
            cursor = ?request.cursor,
            "fetching message page"
        );
        let res = self
            .authorize(
                self.http
                    .get(self.messages_url(&request.conversation_id))
                    .query(&query),
            )
            .send()
            .await?;
        expect_json(res).await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessagePayload, ApiError> {
        let attachment = request.attachment.as_ref();
        let body = SendBody {
            content: &request.content,
            attachment_url: attachment.map(|a| a.url.as_str()),
            attachment_type: attachment.map(|a| a.content_type.as_str()),
            attachment_name: attachment.map(|a| a.filename.as_str()),
        };
        let res = self
            .authorize(
                self.http
                    .post(self.messages_url(&request.conversation_id))
                    .json(&body),
            )
            .send()
            .await?;
        expect_json(res).await
    }
}
