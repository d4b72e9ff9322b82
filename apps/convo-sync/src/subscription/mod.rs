//! Topic subscriptions that outlive individual broker sessions.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

mod registry;

pub use registry::SubscriptionRegistry;

/// Delivery callback for one topic. Receives the parsed JSON payload.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered but not yet confirmed on the current session.
    Pending,
    Active,
    TornDown,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::TornDown => "torn-down",
        })
    }
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub topic: String,
    pub state: SubscriptionState,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("subscription registry has shut down")]
    Closed,
}
