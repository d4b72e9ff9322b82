use crate::ProtoError;
use std::time::Duration;

/// The keep-alive payload: a single end-of-line outside any frame.
pub const HEARTBEAT_EOL: &str = "\n";

/// A `heart-beat:<outgoing>,<incoming>` header value in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

/// Effective intervals once both sides have advertised their heart-beat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatedHeartBeat {
    pub send_every: Option<Duration>,
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    pub fn parse(value: &str) -> Result<Self, ProtoError> {
        let invalid = || ProtoError::InvalidHeartBeat(value.to_string());
        let (outgoing, incoming) = value.split_once(',').ok_or_else(invalid)?;
        let outgoing_ms = outgoing.trim().parse().map_err(|_| invalid())?;
        let incoming_ms = incoming.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(outgoing_ms, incoming_ms))
    }

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Combines our advertised values with the peer's. Either side sending
    /// zero disables that direction.
    pub fn negotiate(self, peer: HeartBeat) -> NegotiatedHeartBeat {
        NegotiatedHeartBeat {
            send_every: pick(self.outgoing_ms, peer.incoming_ms),
            expect_every: pick(self.incoming_ms, peer.outgoing_ms),
        }
    }
}

fn pick(ours: u64, theirs: u64) -> Option<Duration> {
    if ours == 0 || theirs == 0 {
        None
    } else {
        Some(Duration::from_millis(ours.max(theirs)))
    }
}
