//! ILPv4 packet types (Prepare/Fulfill/Reject) and their OER wire encoding.

pub mod address;
pub mod oer;
mod packet;

pub use address::{Address, AddressError, MAX_ADDRESS_LENGTH};
pub use packet::{
    ErrorCode, Fulfill, Packet, PacketError, Prepare, Reject, RejectBuilder, MAX_DATA_LENGTH,
};
