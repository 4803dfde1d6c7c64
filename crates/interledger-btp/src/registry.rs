use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use interledger_errors::BtpError;
use parking_lot::RwLock;
use tracing::debug;

use crate::endpoint::BtpConnection;
use crate::packet::{BtpPacket, ProtocolData};

#[derive(Default, Clone)]
struct PeerEntry {
    outbound: Option<Arc<BtpConnection>>,
    inbound: Option<Arc<BtpConnection>>,
}

/// Tracks every active BTP endpoint -- outbound clients this node initiated and inbound
/// sessions a peer initiated -- and lets callers send to a peer by id regardless of which
/// side originated the connection.
#[derive(Default)]
pub struct PeerRegistry {
    entries: RwLock<HashMap<String, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry::default()
    }

    pub fn set_outbound(&self, peer_id: impl Into<String>, conn: Arc<BtpConnection>) {
        let peer_id = peer_id.into();
        debug!(%peer_id, "registering outbound BTP connection");
        self.entries.write().entry(peer_id).or_default().outbound = Some(conn);
    }

    pub fn set_inbound(&self, peer_id: impl Into<String>, conn: Arc<BtpConnection>) {
        let peer_id = peer_id.into();
        debug!(%peer_id, "registering inbound BTP connection");
        self.entries.write().entry(peer_id).or_default().inbound = Some(conn);
    }

    pub fn remove_outbound(&self, peer_id: &str) {
        if let Some(entry) = self.entries.write().get_mut(peer_id) {
            entry.outbound = None;
        }
    }

    pub fn remove_inbound(&self, peer_id: &str) {
        if let Some(entry) = self.entries.write().get_mut(peer_id) {
            entry.inbound = None;
        }
    }

    /// Admin-driven removal of a peer's whole entry (both sides, if present).
    pub fn remove_peer(&self, peer_id: &str) {
        self.entries.write().remove(peer_id);
    }

    /// `true` if either an outbound or inbound connection is registered for `peer_id`.
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.entries
            .read()
            .get(peer_id)
            .map(|e| e.outbound.is_some() || e.inbound.is_some())
            .unwrap_or(false)
    }

    /// `peerId -> connected` map used by health endpoints.
    pub fn health(&self) -> HashMap<String, bool> {
        self.entries
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.outbound.is_some() || e.inbound.is_some()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.outbound.is_some() || e.inbound.is_some())
            .count()
    }

    /// Sends to `peer_id`, preferring the outbound connection and falling back to inbound.
    pub async fn send_to_peer(
        &self,
        peer_id: &str,
        protocol_data: Vec<ProtocolData>,
        timeout: Duration,
    ) -> Result<BtpPacket, BtpError> {
        let conn = {
            let entries = self.entries.read();
            entries
                .get(peer_id)
                .and_then(|e| e.outbound.clone().or_else(|| e.inbound.clone()))
        };
        match conn {
            Some(conn) => conn.send(protocol_data, timeout).await,
            None => Err(BtpError::Connection(format!("no BTP connection to peer {peer_id}"))),
        }
    }
}
