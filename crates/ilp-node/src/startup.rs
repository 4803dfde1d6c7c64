//! Wires the routing table, peer registry, ledger, settlement monitor, packet handler, and
//! BTP transport together from a loaded [`Config`], then runs until shutdown is requested.

use std::str::FromStr;
use std::sync::Arc;

use interledger_btp::{run_client, run_server, BtpClientConfig, IncomingHandler, PeerRegistry, StaticSecretStore};
use interledger_packet::Address;
use interledger_router::RoutingTable;
use interledger_service::{LocalDelivery, LogEventSink as PacketLogEventSink, PacketHandler, SettlementSettings};
use interledger_settlement::{
    CreditLimitConfig, InMemoryLedger, Ledger, LogEventSink as SettlementLogEventSink, NullExecutor, NullLedger,
    SettlementMonitor, ThresholdConfig,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;

const SETTLEMENT_TOKEN: &str = "ILP";

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid node address {0:?}: {1}")]
    NodeAddress(String, interledger_packet::AddressError),
    #[error("invalid peer URL for peer {peer_id}: {source}")]
    PeerUrl { peer_id: String, source: url::ParseError },
    #[error("invalid local delivery URL: {0}")]
    LocalDeliveryUrl(url::ParseError),
}

/// Everything the running node needs kept alive; dropping this does not itself stop the
/// background tasks -- call [`Node::shutdown`] and await [`Node::join`] for a clean exit.
pub struct Node {
    #[allow(dead_code)]
    pub handler: Arc<PacketHandler>,
    #[allow(dead_code)]
    pub registry: Arc<PeerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Builds every component and spawns the BTP server, one client per configured peer
    /// with an outbound URL, and the settlement monitor if settlement is enabled.
    pub fn start(config: &Config) -> Result<Self, StartupError> {
        let node_address = Address::from_str(&config.node_address)
            .map_err(|e| StartupError::NodeAddress(config.node_address.clone(), e))?;

        let routing_table = Arc::new(RoutingTable::new());
        for route in &config.routes {
            routing_table.add_route(route.prefix.clone(), route.next_hop.clone(), route.priority);
        }

        let registry = Arc::new(PeerRegistry::new());

        let mut secrets = StaticSecretStore::new();
        for peer in &config.peers {
            secrets.insert(peer.id.clone(), peer.secret.clone());
        }
        let secrets = Arc::new(secrets);

        let ledger: Arc<dyn Ledger> = if config.settlement.enabled {
            let mut limits = CreditLimitConfig::new();
            if let Some(ceiling) = config.settlement.global_ceiling {
                limits = limits.with_global_ceiling(ceiling);
            }
            if let Some(default_limit) = config.settlement.default_credit_limit {
                limits = limits.with_default_limit(default_limit);
            }
            for (peer_id, limit) in &config.settlement.peer_credit_limits {
                limits.set_peer_limit(peer_id.clone(), *limit);
            }
            Arc::new(InMemoryLedger::new(limits))
        } else {
            Arc::new(NullLedger)
        };

        let local_delivery = match &config.local_delivery.http_url {
            Some(url) => {
                let url = url::Url::parse(url).map_err(StartupError::LocalDeliveryUrl)?;
                Some(LocalDelivery::Http {
                    client: reqwest::Client::new(),
                    url,
                })
            }
            None => None,
        };

        let settlement_settings = if config.settlement.enabled {
            SettlementSettings::enabled(config.settlement.fee_percentage)
        } else {
            SettlementSettings::disabled()
        };

        let handler = Arc::new(PacketHandler::new(
            node_address,
            routing_table,
            registry.clone(),
            ledger.clone(),
            local_delivery,
            settlement_settings,
            Arc::new(PacketLogEventSink),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let delegate: Arc<dyn IncomingHandler> = handler.clone();
        {
            let bind_address = config.bind_address;
            let secrets = secrets.clone();
            let registry = registry.clone();
            let delegate = delegate.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_server(bind_address, secrets, registry, delegate, shutdown_rx).await {
                    error!(error = %e, "BTP server exited with an error");
                }
            }));
        }

        for peer in &config.peers {
            let Some(url) = &peer.url else { continue };
            let url = url::Url::parse(url).map_err(|source| StartupError::PeerUrl {
                peer_id: peer.id.clone(),
                source,
            })?;
            let client_config = BtpClientConfig {
                peer_id: peer.id.clone(),
                url,
                secret: peer.secret.clone(),
            };
            let registry = registry.clone();
            let delegate = delegate.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                run_client(client_config, registry, delegate, shutdown_rx).await;
            }));
        }

        if config.settlement.enabled && !config.settlement.thresholds.is_empty() {
            let mut threshold_config = ThresholdConfig::new(std::time::Duration::from_secs(config.settlement.poll_interval_secs));
            for (peer_id, threshold) in &config.settlement.thresholds {
                threshold_config.set_threshold(peer_id.clone(), SETTLEMENT_TOKEN, *threshold);
            }
            let monitor = Arc::new(SettlementMonitor::new(
                ledger.clone(),
                Arc::new(NullExecutor),
                Arc::new(SettlementLogEventSink),
                threshold_config,
            ));
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                monitor.run(shutdown_rx).await;
            }));
        }

        info!(node_address = %config.node_address, bind_address = %config.bind_address, "node started");

        Ok(Node {
            handler,
            registry,
            shutdown_tx,
            tasks,
        })
    }

    /// Tells every background task to stop accepting new work.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for every spawned task to finish; call after [`Node::shutdown`].
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
