use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use interledger_errors::BtpError;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::endpoint::{BtpConnection, IncomingHandler};
use crate::registry::PeerRegistry;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BtpClientConfig {
    pub peer_id: String,
    pub url: Url,
    pub secret: String,
}

/// Connects to `config.url`, authenticates, registers the connection as `config.peer_id`'s
/// outbound endpoint, and reconnects with exponential backoff (capped at 60s) on failure or
/// unexpected close, until `shutdown` fires.
pub async fn run_client(
    config: BtpClientConfig,
    registry: Arc<PeerRegistry>,
    delegate: Arc<dyn IncomingHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_once(&config, &registry, delegate.clone()).await {
            Ok(conn) => {
                info!(peer_id = %config.peer_id, "BTP client connected and authenticated");
                backoff = INITIAL_BACKOFF;
                tokio::select! {
                    _ = conn.closed() => {
                        warn!(peer_id = %config.peer_id, "BTP client connection lost, reconnecting");
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            conn.close_with_code(1000, "server shutting down").await;
                            registry.remove_outbound(&config.peer_id);
                            return;
                        }
                    }
                }
                registry.remove_outbound(&config.peer_id);
            }
            Err(e) => {
                warn!(peer_id = %config.peer_id, error = %e, "BTP client connect failed, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_once(
    config: &BtpClientConfig,
    registry: &Arc<PeerRegistry>,
    delegate: Arc<dyn IncomingHandler>,
) -> Result<Arc<BtpConnection>, BtpError> {
    let (ws, _response) = tokio_tungstenite::connect_async(config.url.as_str())
        .await
        .map_err(|e| BtpError::Connection(e.to_string()))?;
    let (sink, stream) = ws.split();
    let conn = BtpConnection::new(Box::pin(sink), Box::pin(stream), delegate);
    conn.authenticate(&config.peer_id, &config.secret).await?;
    conn.set_peer_id(config.peer_id.clone());
    registry.set_outbound(config.peer_id.clone(), conn.clone());
    Ok(conn)
}
