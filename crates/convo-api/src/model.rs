//! Conversation data as it travels over REST and the live topic.
//!
//! `*Payload` types mirror the backend JSON and tolerate missing fields;
//! [`MessagePayload::normalize`] turns them into the immutable [`Message`]
//! the sync engine works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Signed(value) => value.to_string(),
            RawId::Unsigned(value) => value.to_string(),
        }
    }
}

/// Identifier newtypes accept JSON strings as well as numbers, since the
/// backend emits database keys as either.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_string()))
            }
        }
    };
}

id_type!(MessageId);
id_type!(ConversationId);
id_type!(UserId);
id_type!(
    /// Opaque position token handed back by the history endpoint.
    Cursor
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    #[serde(alias = "SENT")]
    Sent,
    #[serde(alias = "DELIVERED")]
    Delivered,
    #[serde(alias = "READ")]
    Read,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    #[serde(alias = "TEXT")]
    Text,
    #[serde(alias = "IMAGE")]
    Image,
    #[serde(alias = "FILE")]
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Before,
    After,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Before => "before",
            Direction::After => "after",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: String,
    pub filename: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// A message exactly as the backend sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
}

/// A normalized message. Identity (`id`) is the only deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub kind: MessageKind,
}

impl MessagePayload {
    /// Fills the fields the backend may omit: status defaults to `sent` and
    /// the type is inferred from the attachment when absent.
    pub fn normalize(self) -> Message {
        let attachment = self.attachment_url.map(|url| {
            let filename = self
                .attachment_name
                .unwrap_or_else(|| filename_from_url(&url));
            Attachment {
                content_type: self
                    .attachment_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                filename,
                url,
            }
        });
        let kind = self.kind.unwrap_or(match &attachment {
            Some(attachment) if attachment.is_image() => MessageKind::Image,
            Some(_) => MessageKind::File,
            None => MessageKind::Text,
        });
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            text: self.content.filter(|text| !text.is_empty()),
            attachment,
            created_at: self.created_at,
            status: self.status.unwrap_or_default(),
            kind,
        }
    }
}

fn filename_from_url(url: &str) -> String {
    let path = url.split(|ch: char| ch == '?' || ch == '#').next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagePayload {
    pub messages: Vec<MessagePayload>,
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
    #[serde(default)]
    pub has_more: bool,
}

/// One page of history, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub messages: Vec<Message>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

impl PagePayload {
    /// A page without a cursor cannot be continued, whatever `hasMore` says.
    pub fn normalize(self) -> Page {
        let has_more = self.has_more && self.next_cursor.is_some();
        Page {
            messages: self
                .messages
                .into_iter()
                .map(MessagePayload::normalize)
                .collect(),
            next_cursor: if has_more { self.next_cursor } else { None },
            has_more,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// RFC 3339 on output; RFC 3339, offset-less ISO-8601 (read as UTC) or epoch
/// milliseconds on input.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Millis(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
            Raw::Millis(millis) => DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {millis}"))),
        }
    }

    pub fn parse(text: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| format!("invalid timestamp {text:?}"))
    }
}
