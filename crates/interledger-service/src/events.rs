//! Packet-lifecycle events: `PACKET_RECEIVED`, `ROUTE_LOOKUP`, `PACKET_FORWARDED`,
//! `PACKET_FULFILLED`, `PACKET_REJECTED`.

use tokio::sync::broadcast;
use tracing::info;

/// A single step in one packet's lifecycle. `packet_id` is `hex(executionCondition)`;
/// `correlation_id` ties every event and log line for one invocation of the handler together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PacketReceived {
        correlation_id: String,
        packet_id: String,
        from_peer_id: String,
        destination: String,
        amount: u64,
    },
    RouteLookup {
        correlation_id: String,
        packet_id: String,
        next_hop: Option<String>,
    },
    PacketForwarded {
        correlation_id: String,
        packet_id: String,
        next_hop: String,
    },
    PacketFulfilled {
        correlation_id: String,
        packet_id: String,
    },
    PacketRejected {
        correlation_id: String,
        packet_id: String,
        code: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Logs every event as structured JSON-friendly fields; the default when no telemetry socket
/// or explorer event-store is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: Event) {
        match event {
            Event::PacketReceived {
                correlation_id,
                packet_id,
                from_peer_id,
                destination,
                amount,
            } => info!(correlation_id, packet_id, from_peer_id, destination, amount, "PACKET_RECEIVED"),
            Event::RouteLookup {
                correlation_id,
                packet_id,
                next_hop,
            } => info!(correlation_id, packet_id, next_hop = next_hop.as_deref(), "ROUTE_LOOKUP"),
            Event::PacketForwarded {
                correlation_id,
                packet_id,
                next_hop,
            } => info!(correlation_id, packet_id, next_hop, "PACKET_FORWARDED"),
            Event::PacketFulfilled {
                correlation_id,
                packet_id,
            } => info!(correlation_id, packet_id, "PACKET_FULFILLED"),
            Event::PacketRejected {
                correlation_id,
                packet_id,
                code,
            } => info!(correlation_id, packet_id, code, "PACKET_REJECTED"),
        }
    }
}

/// Fans events out over a broadcast channel, e.g. to an in-process event store and
/// broadcaster backing a UI explorer. Never wired up alongside [`LogEventSink`] for the
/// same field -- pick one per [`crate::handler::PacketHandler`].
pub struct ChannelEventSink {
    sender: broadcast::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<Event>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (ChannelEventSink { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

/// Emits nothing. Used when neither a telemetry socket nor an explorer event-store is
/// configured; packet forwarding must still work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}
