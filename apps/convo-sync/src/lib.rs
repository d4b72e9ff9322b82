//! Real-time conversation sync: a reconnecting broker connection, a
//! subscription registry that survives reconnects, a per-conversation message
//! store merging history pages with live pushes, and viewport anchoring for
//! lists that grow at both ends.

pub mod config;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub mod transport;
pub mod viewport;

pub use config::{ConfigError, SyncConfig};
pub use store::{ConversationStore, LoadOutcome, Phase, StoreConfig, StoreEvent, SyncError};
pub use subscription::{RegistryError, SubscriptionInfo, SubscriptionRegistry, SubscriptionState};
pub use transport::{
    Connection, ConnectionConfig, ConnectionState, ConnectionStatus, Connector, TransportError,
};
pub use viewport::{ScrollMetrics, ViewportAnchor, anchor_offset};
