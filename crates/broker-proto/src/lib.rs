//! Frame definitions for the broker protocol spoken over the live transport.
//!
//! The broker speaks STOMP 1.2 framing over WebSocket text messages. Keeping
//! the codec in a dedicated crate lets the mock broker used in tests and the
//! client connection share exactly one parser.

mod codec;
mod heartbeat;

pub use codec::{decode, decode_each, encode, Decoded, Inbound};
pub use heartbeat::{HeartBeat, NegotiatedHeartBeat, HEARTBEAT_EOL};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "1.2";

pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame is missing its NUL terminator")]
    UnterminatedFrame,
    #[error("invalid heart-beat header {0:?}")]
    InvalidHeartBeat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Header values on the handshake frames are sent verbatim.
    pub fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(ProtoError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(name, value);
        self
    }

    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first value recorded for `name`; later repeats are ignored.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .header(header::ACCEPT_VERSION, PROTOCOL_VERSION)
            .header(header::HOST, host)
            .header(header::HEART_BEAT, heart_beat.header_value())
    }

    pub fn connected(heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connected)
            .header(header::VERSION, PROTOCOL_VERSION)
            .header(header::HEART_BEAT, heart_beat.header_value())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header(header::ID, id)
            .header(header::DESTINATION, destination)
            .header(header::ACK, "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header(header::ID, id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header(header::DESTINATION, destination)
            .header(header::CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    pub fn disconnect(receipt: Option<&str>) -> Self {
        let frame = Frame::new(Command::Disconnect);
        match receipt {
            Some(id) => frame.header(header::RECEIPT, id),
            None => frame,
        }
    }

    pub fn message(
        destination: &str,
        subscription: &str,
        message_id: &str,
        body: impl Into<String>,
    ) -> Self {
        Frame::new(Command::Message)
            .header(header::DESTINATION, destination)
            .header(header::SUBSCRIPTION, subscription)
            .header(header::MESSAGE_ID, message_id)
            .header(header::CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header(header::RECEIPT_ID, receipt_id)
    }

    pub fn error(message: &str, details: impl Into<String>) -> Self {
        Frame::new(Command::Error)
            .header(header::MESSAGE, message)
            .with_body(details)
    }

    pub fn destination(&self) -> Option<&str> {
        self.get(header::DESTINATION)
    }

    pub fn subscription(&self) -> Option<&str> {
        self.get(header::SUBSCRIPTION)
    }

    /// Parses the `heart-beat` header, treating an absent header as `0,0`.
    pub fn heart_beat(&self) -> Result<HeartBeat, ProtoError> {
        match self.get(header::HEART_BEAT) {
            Some(value) => HeartBeat::parse(value),
            None => Ok(HeartBeat::default()),
        }
    }
}
