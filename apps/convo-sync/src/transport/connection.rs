use super::{Backoff, ConnectionState, ConnectionStatus, Connector, Link, TransportError};
use broker_proto::{
    Command, Frame, HEARTBEAT_EOL, HeartBeat, Inbound, NegotiatedHeartBeat, decode, decode_each,
    encode, header,
};
use parking_lot::Mutex;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

/// MESSAGE and RECEIPT frames received from the broker, in arrival order.
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Virtual host announced in CONNECT.
    pub host: String,
    pub token: Option<String>,
    /// Heart-beat interval we offer in both directions. Zero disables.
    pub heartbeat_interval: Duration,
    /// Bounds the handshake and the longest tolerated inbound silence.
    pub heartbeat_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            token: None,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

impl ConnectionConfig {
    fn heart_beat(&self) -> HeartBeat {
        let millis = u64::try_from(self.heartbeat_interval.as_millis()).unwrap_or(u64::MAX);
        HeartBeat::new(millis, millis)
    }

    fn silence_limit(&self, negotiated: &NegotiatedHeartBeat) -> Option<Duration> {
        negotiated
            .expect_every
            .map(|every| self.heartbeat_timeout.max(every * 2))
    }
}

enum Request {
    Send {
        frame: Frame,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the single broker connection of a client.
///
/// The connection is owned by a supervisor task spawned on [`connect`]. The
/// supervisor is the only writer of the published [`ConnectionStatus`]; it
/// reconnects with exponential backoff until [`disconnect`] is called.
///
/// [`connect`]: Connection::connect
/// [`disconnect`]: Connection::disconnect
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    status: Arc<watch::Sender<ConnectionStatus>>,
    requests: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    frames: mpsc::UnboundedSender<Frame>,
}

impl Connection {
    pub fn new(connector: impl Connector, config: ConnectionConfig) -> (Self, FrameReceiver) {
        Self::with_connector(Arc::new(connector), config)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> (Self, FrameReceiver) {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (frames, inbound) = mpsc::unbounded_channel();
        let inner = Inner {
            connector,
            config,
            status: Arc::new(status),
            requests: Mutex::new(None),
            frames,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            inbound,
        )
    }

    /// Starts the supervisor unless one is already running.
    pub fn connect(&self) {
        let mut requests = self.inner.requests.lock();
        if requests.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *requests = Some(tx);
        drop(requests);

        self.inner.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.attempts = 0;
            status.stopped = false;
        });
        let supervisor = Supervisor {
            connector: self.inner.connector.clone(),
            config: self.inner.config.clone(),
            status: self.inner.status.clone(),
            frames: self.inner.frames.clone(),
        };
        tokio::spawn(supervisor.run(rx));
    }

    /// Closes the session and stops reconnecting. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let requests = self.inner.requests.lock().take();
        if let Some(requests) = requests {
            let (done, finished) = oneshot::channel();
            if requests.send(Request::Shutdown { done }).is_ok() {
                let _ = finished.await;
            }
        }
        self.inner.status.send_if_modified(|status| {
            let before = *status;
            status.state = ConnectionState::Disconnected;
            status.attempts = 0;
            status.stopped = true;
            *status != before
        });
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Resolves once a session is up, or fails if the connection is stopped.
    pub async fn wait_connected(&self) -> Result<(), TransportError> {
        let mut status = self.watch();
        let current = *status
            .wait_for(|status| status.is_connected() || status.stopped)
            .await
            .map_err(|_| TransportError::Closed)?;
        if current.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Stopped)
        }
    }

    /// Writes one frame on the current session.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let requests = self
            .inner
            .requests
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let (ack, acked) = oneshot::channel();
        requests
            .send(Request::Send { frame, ack })
            .map_err(|_| TransportError::NotConnected)?;
        acked.await.unwrap_or(Err(TransportError::Closed))
    }
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    status: Arc<watch::Sender<ConnectionStatus>>,
    frames: mpsc::UnboundedSender<Frame>,
}

struct Session {
    link: Box<dyn Link>,
    heartbeat: NegotiatedHeartBeat,
}

enum Exit {
    Lost(TransportError),
    Shutdown(Option<oneshot::Sender<()>>),
}

enum Control {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

/// Handles a request that arrived while no session is up.
fn refuse(request: Option<Request>) -> Control {
    match request {
        Some(Request::Send { ack, .. }) => {
            let _ = ack.send(Err(TransportError::NotConnected));
            Control::Continue
        }
        Some(Request::Shutdown { done }) => Control::Stop(Some(done)),
        None => Control::Stop(None),
    }
}

impl Supervisor {
    async fn run(self, mut requests: mpsc::UnboundedReceiver<Request>) {
        let endpoint = self.connector.endpoint();
        let limit = self.config.heartbeat_timeout;
        let mut attempt: u32 = 0;

        loop {
            self.publish(ConnectionState::Connecting, attempt);

            let established = {
                let handshake = timeout(limit, self.establish());
                tokio::pin!(handshake);
                loop {
                    tokio::select! {
                        result = &mut handshake => {
                            break match result {
                                Ok(result) => result,
                                Err(_) => Err(TransportError::HandshakeTimeout(limit)),
                            };
                        }
                        request = requests.recv() => {
                            if let Control::Stop(done) = refuse(request) {
                                return self.stop(done);
                            }
                        }
                    }
                }
            };

            match established {
                Ok(session) => {
                    attempt = 0;
                    let epoch = self.mark_connected();
                    info!(
                        target = "convo_sync::transport",
                        endpoint = %endpoint,
                        session = epoch,
                        send_every = ?session.heartbeat.send_every,
                        expect_every = ?session.heartbeat.expect_every,
                        "connected to broker"
                    );
                    match self.drive(session, &mut requests).await {
                        Exit::Shutdown(done) => return self.stop(done),
                        Exit::Lost(err) => warn!(
                            target = "convo_sync::transport",
                            endpoint = %endpoint,
                            session = epoch,
                            error = %err,
                            "connection lost"
                        ),
                    }
                }
                Err(err) => warn!(
                    target = "convo_sync::transport",
                    endpoint = %endpoint,
                    attempt,
                    error = %err,
                    "connect attempt failed"
                ),
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            self.publish(ConnectionState::Disconnected, attempt);
            debug!(
                target = "convo_sync::transport",
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );

            let wake = sleep(delay);
            tokio::pin!(wake);
            loop {
                tokio::select! {
                    _ = &mut wake => break,
                    request = requests.recv() => {
                        if let Control::Stop(done) = refuse(request) {
                            return self.stop(done);
                        }
                    }
                }
            }
        }
    }

    async fn establish(&self) -> Result<Session, TransportError> {
        let mut link = self.connector.open().await?;
        let offered = self.config.heart_beat();
        let mut connect = Frame::connect(&self.config.host, offered);
        if let Some(token) = &self.config.token {
            connect.push_header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        link.send(encode(&connect)).await?;

        loop {
            let text = match link.recv().await {
                Some(text) => text?,
                None => return Err(TransportError::Closed),
            };
            for inbound in decode(&text)? {
                let Inbound::Frame(frame) = inbound else {
                    continue;
                };
                match frame.command {
                    Command::Connected => {
                        let heartbeat = offered.negotiate(frame.heart_beat()?);
                        return Ok(Session { link, heartbeat });
                    }
                    Command::Error => {
                        let reason = frame.get(header::MESSAGE).unwrap_or("unspecified").to_string();
                        link.close().await;
                        return Err(TransportError::Rejected(reason));
                    }
                    other => debug!(
                        target = "convo_sync::transport",
                        command = %other,
                        "ignoring frame before CONNECTED"
                    ),
                }
            }
        }
    }

    async fn drive(
        &self,
        session: Session,
        requests: &mut mpsc::UnboundedReceiver<Request>,
    ) -> Exit {
        let Session {
            mut link,
            heartbeat,
        } = session;
        let silence_limit = self.config.silence_limit(&heartbeat);
        let mut beats = heartbeat.send_every.map(|every| {
            let mut beats = interval_at(Instant::now() + every, every);
            beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
            beats
        });
        let mut last_inbound = Instant::now();

        loop {
            let deadline = silence_limit.map(|limit| last_inbound + limit);
            tokio::select! {
                incoming = link.recv() => match incoming {
                    Some(Ok(text)) => {
                        last_inbound = Instant::now();
                        if let Err(err) = self.dispatch(&text) {
                            link.close().await;
                            return Exit::Lost(err);
                        }
                    }
                    Some(Err(err)) => {
                        link.close().await;
                        return Exit::Lost(err);
                    }
                    None => return Exit::Lost(TransportError::Closed),
                },
                request = requests.recv() => match request {
                    Some(Request::Send { frame, ack }) => {
                        let result = link.send(encode(&frame)).await;
                        let failure = result.clone().err();
                        let _ = ack.send(result);
                        if let Some(err) = failure {
                            link.close().await;
                            return Exit::Lost(err);
                        }
                    }
                    Some(Request::Shutdown { done }) => {
                        farewell(link.as_mut()).await;
                        return Exit::Shutdown(Some(done));
                    }
                    None => {
                        farewell(link.as_mut()).await;
                        return Exit::Shutdown(None);
                    }
                },
                _ = next_beat(&mut beats) => {
                    if let Err(err) = link.send(HEARTBEAT_EOL.to_string()).await {
                        link.close().await;
                        return Exit::Lost(err);
                    }
                    trace!(target = "convo_sync::transport::heartbeat", "heart-beat sent");
                }
                _ = silence(deadline) => {
                    link.close().await;
                    return Exit::Lost(TransportError::HeartbeatTimeout(
                        silence_limit.unwrap_or_default(),
                    ));
                }
            }
        }
    }

    /// Routes one inbound text message. An ERROR frame ends the session.
    fn dispatch(&self, text: &str) -> Result<(), TransportError> {
        let decoded = decode_each(text);
        if let Some(first) = decoded.errors.first() {
            warn!(
                target = "convo_sync::transport",
                dropped = decoded.errors.len(),
                kept = decoded.inbound.len(),
                error = %first,
                "dropping undecodable broker frames"
            );
        }
        for item in decoded.inbound {
            match item {
                Inbound::Heartbeat => {
                    trace!(target = "convo_sync::transport::heartbeat", "heart-beat received");
                }
                Inbound::Frame(frame) => match frame.command {
                    Command::Message | Command::Receipt => {
                        let _ = self.frames.send(frame);
                    }
                    Command::Error => {
                        let reason = frame.get(header::MESSAGE).unwrap_or("unspecified").to_string();
                        return Err(TransportError::Broker(reason));
                    }
                    other => debug!(
                        target = "convo_sync::transport",
                        command = %other,
                        "ignoring unexpected frame"
                    ),
                },
            }
        }
        Ok(())
    }

    fn publish(&self, state: ConnectionState, attempts: u32) {
        self.status.send_modify(|status| {
            status.state = state;
            status.attempts = attempts;
        });
    }

    fn mark_connected(&self) -> u64 {
        let mut epoch = 0;
        self.status.send_modify(|status| {
            status.session += 1;
            status.state = ConnectionState::Connected;
            status.attempts = 0;
            epoch = status.session;
        });
        epoch
    }

    fn stop(&self, done: Option<oneshot::Sender<()>>) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.attempts = 0;
            status.stopped = true;
        });
        info!(
            target = "convo_sync::transport",
            endpoint = %self.connector.endpoint(),
            "connection stopped"
        );
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

async fn farewell(link: &mut dyn Link) {
    let _ = link.send(encode(&Frame::disconnect(None))).await;
    link.close().await;
}

async fn next_beat(beats: &mut Option<Interval>) {
    match beats {
        Some(beats) => {
            beats.tick().await;
        }
        None => pending().await,
    }
}

async fn silence(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBroker;
    use tokio::time::timeout;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            host: "test".into(),
            token: Some("secret".into()),
            heartbeat_interval: Duration::ZERO,
            heartbeat_timeout: Duration::from_millis(500),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
        }
    }

    async fn wait_for_session(connection: &Connection, session: u64) {
        let mut status = connection.watch();
        timeout(
            Duration::from_secs(2),
            status.wait_for(|status| status.is_connected() && status.session >= session),
        )
        .await
        .expect("session timed out")
        .expect("status channel closed");
    }

    #[tokio::test]
    async fn connects_and_forwards_token() {
        let broker = MockBroker::new();
        let (connection, _frames) = Connection::new(broker.clone(), fast_config());
        assert!(!connection.is_connected());

        connection.connect();
        timeout(Duration::from_secs(2), connection.wait_connected())
            .await
            .expect("connect timed out")
            .expect("connect failed");

        assert!(connection.is_connected());
        assert_eq!(connection.status().session, 1);
        let connects = broker.received(Command::Connect);
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].get(header::AUTHORIZATION), Some("Bearer secret"));
        assert_eq!(connects[0].get(header::HOST), Some("test"));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = MockBroker::new();
        let (connection, _frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();
        connection.connect();
        wait_for_session(&connection, 1).await;
        connection.connect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.open_count(), 1);
    }

    #[tokio::test]
    async fn retries_refused_handshakes() {
        let broker = MockBroker::new();
        broker.fail_next(3);
        let (connection, _frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();

        wait_for_session(&connection, 1).await;
        assert_eq!(broker.open_count(), 4);
        assert_eq!(connection.status().attempts, 0);
    }

    #[tokio::test]
    async fn reconnects_after_link_loss() {
        let broker = MockBroker::new();
        let (connection, _frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();
        wait_for_session(&connection, 1).await;

        broker.drop_links();
        wait_for_session(&connection, 2).await;
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn silent_broker_triggers_reconnect() {
        let broker = MockBroker::with_heart_beat(HeartBeat::new(30, 30));
        let mut config = fast_config();
        config.heartbeat_interval = Duration::from_millis(30);
        config.heartbeat_timeout = Duration::from_millis(150);
        let (connection, _frames) = Connection::new(broker.clone(), config);
        connection.connect();
        wait_for_session(&connection, 1).await;

        // Heart-beats keep an idle session alive.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(connection.status().session, 1);
        assert!(broker.heartbeats_received() >= 2);

        broker.set_silent(true);
        let mut status = connection.watch();
        timeout(
            Duration::from_secs(2),
            status.wait_for(|status| !status.is_connected()),
        )
        .await
        .expect("silence went unnoticed")
        .expect("status channel closed");

        broker.set_silent(false);
        wait_for_session(&connection, 2).await;
    }

    #[tokio::test]
    async fn disconnect_stops_reconnecting() {
        let broker = MockBroker::new();
        let (connection, _frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();
        wait_for_session(&connection, 1).await;

        connection.disconnect().await;
        connection.disconnect().await;

        let status = connection.status();
        assert!(status.stopped);
        assert!(!status.is_connected());
        assert_eq!(broker.received(Command::Disconnect).len(), 1);
        assert_eq!(broker.active_links(), 0);
        assert_eq!(
            connection.send(Frame::send("/app/x", "{}")).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            connection.wait_connected().await,
            Err(TransportError::Stopped)
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn forwards_message_frames() {
        let broker = MockBroker::new();
        let (connection, mut frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();
        wait_for_session(&connection, 1).await;

        connection
            .send(Frame::subscribe("sub-0", "/topic/conversations/7"))
            .await
            .expect("subscribe");
        assert_eq!(broker.publish("/topic/conversations/7", r#"{"id":1}"#), 1);

        let frame = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("no frame")
            .expect("frames closed");
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.subscription(), Some("sub-0"));
        assert_eq!(frame.body, r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn broken_frame_keeps_its_batch_neighbours() {
        let broker = MockBroker::new();
        let (connection, mut frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();
        wait_for_session(&connection, 1).await;

        let batch = format!(
            "MESSAGE\ncontent-length:oops\n\n{{}}\0{}",
            encode(&Frame::message("/topic/conversations/7", "sub-0", "m-2", r#"{"id":2}"#))
        );
        broker.push_raw(&batch);

        let frame = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("no frame")
            .expect("frames closed");
        assert_eq!(frame.get(header::MESSAGE_ID), Some("m-2"));
        assert_eq!(frame.body, r#"{"id":2}"#);
        assert_eq!(connection.status().session, 1);
    }

    #[tokio::test]
    async fn broker_error_frame_ends_session() {
        let broker = MockBroker::new();
        let (connection, _frames) = Connection::new(broker.clone(), fast_config());
        connection.connect();
        wait_for_session(&connection, 1).await;

        broker.push_error("session expired");
        wait_for_session(&connection, 2).await;
    }
}
