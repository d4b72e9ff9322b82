use super::{Connector, Link, TransportError};
use async_trait::async_trait;
use broker_proto::{Command, Frame, HEARTBEAT_EOL, HeartBeat, Inbound, decode, encode, header};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

/// In-process broker speaking the same frames as the real endpoint.
///
/// Every [`Connector::open`] creates a link registered with the broker, so
/// tests can publish into subscriptions, refuse handshakes, sever every link
/// at once, or go silent to starve the client's heart-beat watchdog.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    heart_beat: HeartBeat,
    next_link: u64,
    next_message: u64,
    links: HashMap<u64, LinkEntry>,
    refuse: usize,
    silent: bool,
    opened: usize,
    handshakes: usize,
    heartbeats: usize,
    received: Vec<Frame>,
}

struct LinkEntry {
    outbound: mpsc::UnboundedSender<String>,
    subscriptions: Vec<(String, String)>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that answers CONNECT with `heart_beat` and, once connected,
    /// emits heart-beats every `heart_beat.outgoing_ms`.
    pub fn with_heart_beat(heart_beat: HeartBeat) -> Self {
        let broker = Self::default();
        broker.state.lock().heart_beat = heart_beat;
        broker
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().refuse = count;
    }

    /// Severs every open link as if the network dropped.
    pub fn drop_links(&self) {
        self.state.lock().links.clear();
    }

    /// While silent the broker swallows everything it would send, heart-beats
    /// and CONNECTED replies included.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Delivers `body` to every subscription on `destination`. Returns the
    /// number of MESSAGE frames written.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        self.state.lock().fan_out(destination, body)
    }

    /// Sends an ERROR frame on every link.
    pub fn push_error(&self, message: &str) {
        self.push_raw(&encode(&Frame::error(message, "")));
    }

    /// Writes `text` as one transport message on every link, unchecked.
    pub fn push_raw(&self, text: &str) {
        let state = self.state.lock();
        for entry in state.links.values() {
            let _ = entry.outbound.send(text.to_string());
        }
    }

    /// Destinations currently subscribed, one entry per subscription.
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut destinations: Vec<String> = state
            .links
            .values()
            .flat_map(|entry| entry.subscriptions.iter().map(|(_, dest)| dest.clone()))
            .collect();
        destinations.sort();
        destinations
    }

    /// Frames received from clients with the given command.
    pub fn received(&self, command: Command) -> Vec<Frame> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|frame| frame.command == command)
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().handshakes
    }

    pub fn heartbeats_received(&self) -> usize {
        self.state.lock().heartbeats
    }

    pub fn active_links(&self) -> usize {
        self.state.lock().links.len()
    }
}

impl BrokerState {
    /// Applies one client frame. Returns true when it completed a handshake.
    fn handle(&mut self, link: u64, frame: Frame) -> bool {
        self.received.push(frame.clone());
        match frame.command {
            Command::Connect | Command::Stomp => {
                if self.silent {
                    return false;
                }
                self.handshakes += 1;
                let connected = Frame::connected(self.heart_beat)
                    .header(header::SESSION, format!("mock-{link}"));
                self.reply(link, &connected);
                return true;
            }
            Command::Subscribe => {
                if let (Some(id), Some(destination), Some(entry)) =
                    (frame.get(header::ID), frame.destination(), self.links.get_mut(&link))
                {
                    entry.subscriptions.retain(|(existing, _)| existing != id);
                    entry
                        .subscriptions
                        .push((id.to_string(), destination.to_string()));
                }
            }
            Command::Unsubscribe => {
                if let (Some(id), Some(entry)) = (frame.get(header::ID), self.links.get_mut(&link)) {
                    entry.subscriptions.retain(|(existing, _)| existing != id);
                }
            }
            Command::Send => {
                if let Some(destination) = frame.destination() {
                    self.fan_out(destination, &frame.body);
                }
            }
            Command::Disconnect => {
                if let Some(receipt) = frame.get(header::RECEIPT) {
                    self.reply(link, &Frame::receipt(receipt));
                }
                self.links.remove(&link);
                return false;
            }
            _ => {}
        }
        if let Some(receipt) = frame.get(header::RECEIPT) {
            self.reply(link, &Frame::receipt(receipt));
        }
        false
    }

    fn reply(&self, link: u64, frame: &Frame) {
        if self.silent {
            return;
        }
        if let Some(entry) = self.links.get(&link) {
            let _ = entry.outbound.send(encode(frame));
        }
    }

    fn fan_out(&mut self, destination: &str, body: &str) -> usize {
        if self.silent {
            return 0;
        }
        let mut next = self.next_message;
        let mut delivered = 0;
        for entry in self.links.values() {
            for (id, _) in entry
                .subscriptions
                .iter()
                .filter(|(_, subscribed)| subscribed == destination)
            {
                next += 1;
                let frame = Frame::message(destination, id, &format!("msg-{next}"), body);
                if entry.outbound.send(encode(&frame)).is_ok() {
                    delivered += 1;
                }
            }
        }
        self.next_message = next;
        delivered
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn open(&self) -> Result<Box<dyn Link>, TransportError> {
        let mut state = self.state.lock();
        state.opened += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::Connect {
                endpoint: self.endpoint(),
                reason: "refused by mock broker".into(),
            });
        }
        let id = state.next_link;
        state.next_link += 1;
        let (outbound, inbound) = mpsc::unbounded_channel();
        state.links.insert(
            id,
            LinkEntry {
                outbound,
                subscriptions: Vec::new(),
            },
        );
        Ok(Box::new(MockLink {
            id,
            broker: self.clone(),
            inbound,
            heartbeat: None,
        }))
    }

    fn endpoint(&self) -> String {
        "mock://broker".to_string()
    }
}

struct MockLink {
    id: u64,
    broker: MockBroker,
    inbound: mpsc::UnboundedReceiver<String>,
    heartbeat: Option<(Duration, Instant)>,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let inbound = decode(&text)?;
        let mut state = self.broker.state.lock();
        if !state.links.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        for item in inbound {
            match item {
                Inbound::Heartbeat => state.heartbeats += 1,
                Inbound::Frame(frame) => {
                    if state.handle(self.id, frame) && state.heart_beat.outgoing_ms > 0 {
                        let every = Duration::from_millis(state.heart_beat.outgoing_ms);
                        self.heartbeat = Some((every, Instant::now() + every));
                    }
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let due = self.heartbeat.map(|(_, at)| at);
            tokio::select! {
                text = self.inbound.recv() => return text.map(Ok),
                _ = beat_due(due) => {
                    if let Some((every, at)) = self.heartbeat.as_mut() {
                        *at += *every;
                    }
                    if !self.broker.state.lock().silent {
                        return Some(Ok(HEARTBEAT_EOL.to_string()));
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.broker.state.lock().links.remove(&self.id);
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.broker.state.lock().links.remove(&self.id);
    }
}

async fn beat_due(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake(broker: &MockBroker) -> Box<dyn Link> {
        let mut link = broker.open().await.expect("open");
        link.send(encode(&Frame::connect("test", HeartBeat::default())))
            .await
            .expect("connect");
        let reply = link.recv().await.expect("reply").expect("text");
        match decode(&reply).expect("decode").as_slice() {
            [Inbound::Frame(frame)] => assert_eq!(frame.command, Command::Connected),
            other => panic!("unexpected reply {other:?}"),
        }
        link
    }

    #[tokio::test]
    async fn subscriptions_receive_published_messages() {
        let broker = MockBroker::new();
        let mut link = handshake(&broker).await;
        link.send(encode(&Frame::subscribe("sub-1", "/topic/a")))
            .await
            .expect("subscribe");

        assert_eq!(broker.subscriptions(), ["/topic/a"]);
        assert_eq!(broker.publish("/topic/a", "{}"), 1);
        assert_eq!(broker.publish("/topic/b", "{}"), 0);

        let text = link.recv().await.expect("message").expect("text");
        let frames = decode(&text).expect("decode");
        let [Inbound::Frame(frame)] = frames.as_slice() else {
            panic!("expected one frame");
        };
        assert_eq!(frame.subscription(), Some("sub-1"));

        link.send(encode(&Frame::unsubscribe("sub-1")))
            .await
            .expect("unsubscribe");
        assert!(broker.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn dropped_links_end_the_stream() {
        let broker = MockBroker::new();
        let mut link = handshake(&broker).await;
        broker.drop_links();
        assert!(link.recv().await.is_none());
        assert_eq!(
            link.send(HEARTBEAT_EOL.to_string()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn refused_opens_are_counted() {
        let broker = MockBroker::new();
        broker.fail_next(1);
        assert!(broker.open().await.is_err());
        assert!(broker.open().await.is_ok());
        assert_eq!(broker.open_count(), 2);
    }
}
