use serde::{Deserialize, Serialize};

/// Rendezvous hub events (listener lifecycle, handshakes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    /// The hub bound its listening socket
    Listening { endpoint: String },

    /// A spawned worker presented a valid key
    HandshakeCompleted { request_id: u64 },

    /// A connection was dropped before presenting a valid key
    ForeignConnectionDropped { reason: String },

    /// Nobody connected for a pending accept before the start timeout
    AcceptTimedOut { request_id: u64, timeout_ms: u64 },

    /// A tracked thread exited without closing its channel
    ChannelAutoClosed { context_id: u64 },
}
