//! The packet-forwarding handler that sits between the BTP transport and the routing table,
//! ledger, and local-delivery seam.

pub mod events;
pub mod handler;
pub mod local_delivery;

pub use events::{ChannelEventSink, Event, EventSink, LogEventSink, NullEventSink};
pub use handler::{PacketHandler, SettlementSettings};
pub use local_delivery::{
    FulfillBody, LocalDelivery, LocalDeliveryHandler, LocalDeliveryRequest, LocalDeliveryResponse, RejectBody,
};
