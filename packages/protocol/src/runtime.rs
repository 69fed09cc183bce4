//! Command and event types crossing the host boundary.
//!
//! The host event loop drives the engine through a `flume` command channel
//! and observes it through an event channel. Payloads are `bytes::Bytes`, so
//! a broadcast clones cheaply before the engine deep-copies per queue.

use bytes::Bytes;

/// Host-to-engine commands.
#[derive(Debug, Clone)]
pub enum BridgeCommand {
    /// Enqueue an outbound application packet. `recipient` is the target
    /// slave address; `None` (or a zero packet UID) broadcasts.
    Dispatch {
        packet: Bytes,
        recipient: Option<u8>,
    },
    /// Shut the bus loop down.
    Stop,
}

/// Engine-to-host events.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// An inbound application packet parsed off the wire.
    Inbound(Bytes),
    /// A data reply revealed which slave owns a UID.
    RecipientDiscovered { uid: u32, address: u8 },
    /// Non-fatal runtime error, surfaced for logging.
    Error(String),
    /// The bus loop exited.
    Stopped,
}
