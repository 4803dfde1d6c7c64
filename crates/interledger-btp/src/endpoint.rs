use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use interledger_errors::BtpError;
use parking_lot::Mutex as SyncMutex;
use rand::RngExt;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

use crate::packet::{BtpError as BtpErrorFrame, BtpPacket, BtpResponse, ProtocolData, Serializable};

/// Connection-level sends (authentication, protocol-data-only messages) default to this.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// An endpoint whose pending-request map grows past this is assumed to own a stuck peer.
pub const MAX_PENDING_REQUESTS: usize = 10_000;

pub type BoxedSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub type BoxedStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// What a received MESSAGE frame should be answered with.
pub enum InboundOutcome {
    Response(Vec<ProtocolData>),
    Error {
        code: String,
        name: String,
        message: String,
    },
}

/// Handles MESSAGE frames that arrive on a connection and are not resolving one of our own
/// pending requests -- i.e. the peer forwarding a packet, or authenticating, to us.
#[async_trait]
pub trait IncomingHandler: Send + Sync {
    async fn handle_message(&self, peer_id: &str, protocol_data: Vec<ProtocolData>) -> InboundOutcome;
}

#[derive(Default)]
struct PendingRequests {
    inner: SyncMutex<HashMap<u32, oneshot::Sender<BtpPacket>>>,
}

impl PendingRequests {
    fn register(&self, request_id: u32) -> oneshot::Receiver<BtpPacket> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(request_id, tx);
        rx
    }

    fn resolve(&self, request_id: u32, packet: BtpPacket) {
        if let Some(tx) = self.inner.lock().remove(&request_id) {
            let _ = tx.send(packet);
        } else {
            debug!(request_id, "dropping unmatched BTP response/error frame");
        }
    }

    fn cancel(&self, request_id: u32) {
        self.inner.lock().remove(&request_id);
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn fail_all(&self) {
        // Dropping the senders fails every outstanding `rx.await` with `RecvError`, which
        // `BtpConnection::send` maps to a connection error.
        self.inner.lock().clear();
    }
}

/// One WebSocket connection to a peer, either client-originated or server-accepted. Owns the
/// write half; the read half is driven by a background task spawned in [`BtpConnection::new`].
pub struct BtpConnection {
    sink: AsyncMutex<BoxedSink>,
    pending: Arc<PendingRequests>,
    peer_id: SyncMutex<Option<String>>,
    next_request_id: AtomicU32,
    closed: Arc<Notify>,
}

impl BtpConnection {
    pub fn new(sink: BoxedSink, stream: BoxedStream, incoming: Arc<dyn IncomingHandler>) -> Arc<Self> {
        let conn = Arc::new(BtpConnection {
            sink: AsyncMutex::new(sink),
            pending: Arc::new(PendingRequests::default()),
            peer_id: SyncMutex::new(None),
            next_request_id: AtomicU32::new(rand::rng().random()),
            closed: Arc::new(Notify::new()),
        });
        tokio::spawn(Self::read_loop(conn.clone(), stream, incoming));
        conn
    }

    async fn read_loop(conn: Arc<Self>, mut stream: BoxedStream, incoming: Arc<dyn IncomingHandler>) {
        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Binary(bytes)) => conn.handle_frame(&bytes, &incoming).await,
                Ok(Message::Close(_)) => {
                    debug!("BTP peer closed the connection");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "BTP connection read error");
                    break;
                }
            }
        }
        conn.pending.fail_all();
        conn.closed.notify_waiters();
    }

    async fn handle_frame(&self, bytes: &[u8], incoming: &Arc<dyn IncomingHandler>) {
        match BtpPacket::from_bytes(bytes) {
            Ok(BtpPacket::Message(m)) => {
                let peer_id = self.peer_id().unwrap_or_default();
                let outcome = incoming.handle_message(&peer_id, m.protocol_data).await;
                let reply = match outcome {
                    InboundOutcome::Response(protocol_data) => BtpPacket::Response(BtpResponse {
                        request_id: m.request_id,
                        protocol_data,
                    }),
                    InboundOutcome::Error { code, name, message } => {
                        BtpPacket::Error(BtpErrorFrame::new(m.request_id, &code, &name, &message))
                    }
                };
                if let Err(e) = self.write_frame(reply.to_bytes()).await {
                    warn!(error = %e, "failed to write BTP reply frame");
                }
            }
            Ok(BtpPacket::Response(r)) => self.pending.resolve(r.request_id, BtpPacket::Response(r)),
            Ok(BtpPacket::Error(e)) => self.pending.resolve(e.request_id, BtpPacket::Error(e)),
            Err(parse_err) => {
                warn!(error = %parse_err, "BTP frame parse failure");
                let request_id = if bytes.len() >= 5 {
                    u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]])
                } else {
                    0
                };
                let err_frame = BtpErrorFrame::new(request_id, "F00", "NotAcceptedError", &parse_err.to_string());
                let _ = self.write_frame(BtpPacket::Error(err_frame).to_bytes()).await;
            }
        }
    }

    async fn write_frame(&self, bytes: Vec<u8>) -> Result<(), tungstenite::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(bytes.into())).await
    }

    pub fn set_peer_id(&self, peer_id: String) {
        *self.peer_id.lock() = Some(peer_id);
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().clone()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolves once the connection's read loop has ended (peer closed, error, or shutdown).
    pub async fn closed(&self) {
        self.closed.notified().await
    }

    pub async fn close_with_code(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(Some(frame))).await;
    }

    /// Sends a MESSAGE frame and awaits the matching RESPONSE or ERROR, honoring `timeout`.
    pub async fn send(
        &self,
        protocol_data: Vec<ProtocolData>,
        timeout: Duration,
    ) -> Result<BtpPacket, BtpError> {
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            return Err(BtpError::Overloaded);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(request_id);
        let message = BtpPacket::Message(crate::packet::BtpMessage {
            request_id,
            protocol_data,
        });

        {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Binary(message.to_bytes().into()))
                .await
                .map_err(|e| BtpError::Connection(e.to_string()))?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(packet)) => match packet {
                BtpPacket::Error(e) => Err(BtpError::Remote {
                    code: e.code,
                    message: e.data,
                }),
                other => Ok(other),
            },
            Ok(Err(_)) => Err(BtpError::Connection("connection closed while awaiting response".into())),
            Err(_) => {
                self.pending.cancel(request_id);
                Err(BtpError::Timeout)
            }
        }
    }

    /// Sends the BTP authentication handshake and awaits the server's RESPONSE/ERROR.
    pub async fn authenticate(&self, peer_id: &str, secret: &str) -> Result<(), BtpError> {
        let payload = crate::auth::AuthRequest {
            peer_id: peer_id.to_owned(),
            secret: secret.to_owned(),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| BtpError::Connection(format!("failed to encode auth payload: {e}")))?;
        let protocol_data = vec![ProtocolData {
            protocol_name: "auth".to_owned(),
            content_type: crate::packet::ContentType::ApplicationOctetStream,
            data: body,
        }];
        self.send(protocol_data, DEFAULT_TIMEOUT).await?;
        Ok(())
    }
}

/// Computes the send timeout for a forwarded packet: `remaining - 500ms`, floored at 1s.
pub fn forwarding_timeout(remaining: Duration) -> Duration {
    const SAFETY_MARGIN: Duration = Duration::from_millis(500);
    const FLOOR: Duration = Duration::from_secs(1);
    remaining.checked_sub(SAFETY_MARGIN).unwrap_or(Duration::ZERO).max(FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_timeout_applies_safety_margin_and_floor() {
        assert_eq!(forwarding_timeout(Duration::from_secs(5)), Duration::from_millis(4500));
        assert_eq!(forwarding_timeout(Duration::from_millis(800)), Duration::from_secs(1));
        assert_eq!(forwarding_timeout(Duration::from_millis(100)), Duration::from_secs(1));
    }
}
