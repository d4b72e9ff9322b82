use super::{Connector, Link, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

/// Opens broker links over a WebSocket upgrade. Every reconnect dials the
/// same URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|err| TransportError::Connect {
            endpoint: url.to_string(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::Connect {
                endpoint: url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Box<dyn Link>, TransportError> {
        let (stream, response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    endpoint: self.url.to_string(),
                    reason: err.to_string(),
                })?;
        debug!(
            target = "convo_sync::transport::websocket",
            url = %self.url,
            status = %response.status(),
            "websocket upgraded"
        );
        Ok(Box::new(WebSocketLink { stream }))
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!(
                        target = "convo_sync::transport::websocket",
                        "dropping non utf-8 binary message"
                    ),
                },
                Ok(Message::Close(frame)) => {
                    debug!(
                        target = "convo_sync::transport::websocket",
                        frame = ?frame,
                        "peer closed websocket"
                    );
                    return None;
                }
                Ok(_) => {}
                Err(err) => return Some(Err(TransportError::WebSocket(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(WebSocketConnector::new("ws://127.0.0.1:8080/ws").is_ok());
        assert!(WebSocketConnector::new("wss://chat.example.com/ws").is_ok());
        assert!(matches!(
            WebSocketConnector::new("http://chat.example.com/ws"),
            Err(TransportError::Connect { .. })
        ));
        assert!(WebSocketConnector::new("not a url").is_err());
    }
}
