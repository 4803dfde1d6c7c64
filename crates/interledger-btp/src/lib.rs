//! Bilateral Transfer Protocol (BTP): a framed, authenticated, request/response-multiplexed
//! transport over WebSocket connections, carrying ILP packets between peers.

pub mod auth;
pub mod client;
pub mod endpoint;
mod error;
pub mod packet;
pub mod registry;
pub mod server;

pub use auth::{EnvSecretStore, SecretStore, StaticSecretStore};
pub use client::{run_client, BtpClientConfig};
pub use endpoint::{forwarding_timeout, BtpConnection, IncomingHandler, InboundOutcome, DEFAULT_TIMEOUT};
pub use error::FrameError;
pub use packet::{find_ilp_packet, ilp_protocol_data, BtpPacket, ContentType, ProtocolData, Serializable};
pub use registry::PeerRegistry;
pub use server::run_server;
