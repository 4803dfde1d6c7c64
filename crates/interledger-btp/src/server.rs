use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use interledger_errors::BtpError;
use once_cell::sync::OnceCell;
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth::{extract_auth, SecretStore};
use crate::endpoint::{BtpConnection, IncomingHandler, InboundOutcome};
use crate::packet::ProtocolData;
use crate::registry::PeerRegistry;

/// Delay between replying to a failed authentication attempt and closing the socket, giving
/// the peer a chance to read the BTP ERROR frame first.
const AUTH_FAILURE_GRACE: Duration = Duration::from_millis(200);

/// Runs the BTP accept loop on `addr` until `shutdown` fires. Each accepted connection starts
/// unauthenticated; the first MESSAGE it sends must carry an `auth` sub-frame, after which
/// subsequent messages are handed to `delegate`.
pub async fn run_server(
    addr: SocketAddr,
    secrets: Arc<dyn SecretStore>,
    registry: Arc<PeerRegistry>,
    delegate: Arc<dyn IncomingHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let secrets = secrets.clone();
                let registry = registry.clone();
                let delegate = delegate.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(stream, secrets, registry, delegate).await {
                        warn!(%peer_addr, error = %e, "BTP server connection ended with an error");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("BTP server shutting down accept loop");
                    return Ok(());
                }
            }
        }
    }
}

async fn accept_connection(
    stream: tokio::net::TcpStream,
    secrets: Arc<dyn SecretStore>,
    registry: Arc<PeerRegistry>,
    delegate: Arc<dyn IncomingHandler>,
) -> Result<(), BtpError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| BtpError::Connection(e.to_string()))?;
    let (sink, stream) = ws.split();

    let session = Arc::new(ServerSessionHandler::new(secrets, registry, delegate));
    let conn = BtpConnection::new(Box::pin(sink), Box::pin(stream), session.clone());
    let _ = session.conn.set(conn.clone());

    conn.closed().await;
    if let Some(peer_id) = conn.peer_id() {
        session.registry.remove_inbound(&peer_id);
    }
    Ok(())
}

/// Implements the server-side half of the auth handshake, then delegates authenticated
/// traffic to the node's packet handler.
struct ServerSessionHandler {
    secrets: Arc<dyn SecretStore>,
    registry: Arc<PeerRegistry>,
    delegate: Arc<dyn IncomingHandler>,
    authenticated: AtomicBool,
    peer_id: SyncMutex<Option<String>>,
    conn: OnceCell<Arc<BtpConnection>>,
}

impl ServerSessionHandler {
    fn new(secrets: Arc<dyn SecretStore>, registry: Arc<PeerRegistry>, delegate: Arc<dyn IncomingHandler>) -> Self {
        ServerSessionHandler {
            secrets,
            registry,
            delegate,
            authenticated: AtomicBool::new(false),
            peer_id: SyncMutex::new(None),
            conn: OnceCell::new(),
        }
    }

    fn schedule_close_after_auth_failure(&self) {
        if let Some(conn) = self.conn.get().cloned() {
            tokio::spawn(async move {
                tokio::time::sleep(AUTH_FAILURE_GRACE).await;
                conn.close_with_code(1008, "authentication failed").await;
            });
        }
    }
}

#[async_trait]
impl IncomingHandler for ServerSessionHandler {
    async fn handle_message(&self, _peer_id: &str, protocol_data: Vec<ProtocolData>) -> InboundOutcome {
        if !self.authenticated.load(Ordering::SeqCst) {
            let Some(auth) = extract_auth(&protocol_data) else {
                self.schedule_close_after_auth_failure();
                return InboundOutcome::Error {
                    code: "F00".to_owned(),
                    name: "NotAuthorizedError".to_owned(),
                    message: "authentication failed: missing auth sub-frame".to_owned(),
                };
            };
            let expected = self.secrets.secret_for(&auth.peer_id);
            if expected.as_deref() != Some(auth.secret.as_str()) {
                self.schedule_close_after_auth_failure();
                return InboundOutcome::Error {
                    code: "F00".to_owned(),
                    name: "NotAuthorizedError".to_owned(),
                    message: "authentication failed".to_owned(),
                };
            }

            self.authenticated.store(true, Ordering::SeqCst);
            *self.peer_id.lock() = Some(auth.peer_id.clone());
            if let Some(conn) = self.conn.get() {
                conn.set_peer_id(auth.peer_id.clone());
                self.registry.set_inbound(auth.peer_id, conn.clone());
            }
            return InboundOutcome::Response(vec![]);
        }

        let peer_id = self.peer_id.lock().clone().unwrap_or_default();
        self.delegate.handle_message(&peer_id, protocol_data).await
    }
}
