//! The packet-forwarding handler: the RFC-0027-style state machine that turns an incoming
//! Prepare into a Fulfill or Reject.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use interledger_btp::{find_ilp_packet, ilp_protocol_data, forwarding_timeout, IncomingHandler, InboundOutcome, PeerRegistry};
use interledger_errors::BtpError;
use interledger_packet::{Address, ErrorCode, Fulfill, Packet, Prepare, Reject, RejectBuilder};
use interledger_router::RoutingTable;
use interledger_settlement::Ledger;
use rand::RngExt;
use tracing::{info_span, warn, Instrument};

use crate::events::{Event, EventSink};
use crate::local_delivery::{LocalDelivery, LocalDeliveryRequest};

/// Token id every packet-forwarding transfer is recorded under; the connector does not (yet)
/// distinguish settlement assets per peer.
const SETTLEMENT_TOKEN: &str = "ILP";

/// Subtracted from `expiresAt` on every forwarded packet, regardless of settlement.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_millis(1000);

/// Default send timeout for the local-delivery HTTP branch; not derived from the packet's
/// expiry since the local delivery handler is not a BTP connection.
const LOCAL_DELIVERY_DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hash64(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Derives the 128-bit transfer id for one leg of a packet's dual-leg settlement recording.
/// `leg_marker` is `0x01` for the incoming leg, `0x02` for the outgoing leg.
fn transfer_id(execution_condition: &[u8; 32], node_id: &str, leg_marker: u8) -> u128 {
    let high = u64::from_be_bytes(execution_condition[0..8].try_into().unwrap());
    let low = u64::from_be_bytes(execution_condition[24..32].try_into().unwrap());
    let high = high ^ hash64(node_id);
    let id = ((high as u128) << 64) | low as u128;
    id ^ leg_marker as u128
}

fn correlation_id() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

/// Settlement configuration: whether recording is enabled at all, and the forwarding fee.
#[derive(Debug, Clone, Copy)]
pub struct SettlementSettings {
    pub enabled: bool,
    /// Fee in basis points (1/100 of a percent), e.g. `10` for 0.1%.
    pub fee_basis_points: u64,
}

impl SettlementSettings {
    pub fn disabled() -> Self {
        SettlementSettings {
            enabled: false,
            fee_basis_points: 0,
        }
    }

    /// `fee_percentage` is a human percentage, e.g. `0.1` for 0.1%; converted to basis points
    /// by truncating at construction time, matching `basisPoints = floor(feePercentage * 100)`.
    pub fn enabled(fee_percentage: f64) -> Self {
        SettlementSettings {
            enabled: true,
            fee_basis_points: (fee_percentage * 100.0).floor() as u64,
        }
    }
}

/// Turns incoming Prepares into Fulfills or Rejects: validates, looks up the next hop,
/// delivers locally or forwards, and records settlement transfers along the way.
pub struct PacketHandler {
    node_address: Address,
    routing_table: Arc<RoutingTable>,
    registry: Arc<PeerRegistry>,
    ledger: Arc<dyn Ledger>,
    local_delivery: Option<LocalDelivery>,
    settlement: SettlementSettings,
    event_sink: Arc<dyn EventSink>,
}

impl PacketHandler {
    pub fn new(
        node_address: Address,
        routing_table: Arc<RoutingTable>,
        registry: Arc<PeerRegistry>,
        ledger: Arc<dyn Ledger>,
        local_delivery: Option<LocalDelivery>,
        settlement: SettlementSettings,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        PacketHandler {
            node_address,
            routing_table,
            registry,
            ledger,
            local_delivery,
            settlement,
            event_sink,
        }
    }

    fn reject(&self, code: ErrorCode, message: impl AsRef<[u8]>) -> Reject {
        RejectBuilder {
            code,
            message: message.as_ref(),
            triggered_by: Some(&self.node_address),
            data: &[],
        }
        .build()
    }

    /// `handlePreparePacket(prepare, fromPeerId) -> fulfill | reject`. Always returns one of
    /// the two packet types; `Err` is reserved for the rare case a forwarded send fails in a
    /// way this handler does not classify, which the caller maps to a BTP-level `F00`.
    pub async fn handle_prepare_packet(&self, prepare: Prepare, from_peer_id: &str) -> Result<Packet, BtpError> {
        let correlation_id = correlation_id();
        let packet_id = hex_encode(&prepare.execution_condition);
        let span = info_span!("handle_prepare_packet", correlation_id = %correlation_id, packet_id = %packet_id);

        async {
            self.event_sink.emit(Event::PacketReceived {
                correlation_id: correlation_id.clone(),
                packet_id: packet_id.clone(),
                from_peer_id: from_peer_id.to_owned(),
                destination: prepare.destination.to_string(),
                amount: prepare.amount,
            });

            if prepare.expires_at <= Utc::now() {
                let reject = self.reject(ErrorCode::R00, "Packet has expired");
                self.finish(&correlation_id, &packet_id, Packet::Reject(reject.clone()));
                return Ok(Packet::Reject(reject));
            }

            let next_hop = self.routing_table.get_next_hop(prepare.destination.as_str());
            self.event_sink.emit(Event::RouteLookup {
                correlation_id: correlation_id.clone(),
                packet_id: packet_id.clone(),
                next_hop: next_hop.clone(),
            });

            let Some(next_hop) = next_hop else {
                let reject = self.reject(
                    ErrorCode::F02,
                    format!("No route to destination: {}", prepare.destination),
                );
                self.finish(&correlation_id, &packet_id, Packet::Reject(reject.clone()));
                return Ok(Packet::Reject(reject));
            };

            let is_local = next_hop == interledger_router::LOCAL_PEER_ID || next_hop == self.node_address.as_str();
            let outcome = if is_local {
                Ok(self.deliver_locally(&prepare, from_peer_id).await)
            } else {
                self.forward(&prepare, from_peer_id, &next_hop, &correlation_id, &packet_id)
                    .await
            };

            match outcome {
                Ok(packet) => {
                    self.finish(&correlation_id, &packet_id, packet.clone());
                    Ok(packet)
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await
    }

    fn finish(&self, correlation_id: &str, packet_id: &str, packet: Packet) {
        match packet {
            Packet::Fulfill(_) => self.event_sink.emit(Event::PacketFulfilled {
                correlation_id: correlation_id.to_owned(),
                packet_id: packet_id.to_owned(),
            }),
            Packet::Reject(r) => self.event_sink.emit(Event::PacketRejected {
                correlation_id: correlation_id.to_owned(),
                packet_id: packet_id.to_owned(),
                code: r.code.as_str().to_owned(),
            }),
            Packet::Prepare(_) => unreachable!("handler never produces a Prepare as its own outcome"),
        }
    }

    async fn deliver_locally(&self, prepare: &Prepare, from_peer_id: &str) -> Packet {
        let Some(delivery) = &self.local_delivery else {
            return Packet::Fulfill(Fulfill {
                fulfillment: prepare.execution_condition,
                data: prepare.data.clone(),
            });
        };

        let request = LocalDeliveryRequest {
            destination: prepare.destination.to_string(),
            amount: prepare.amount.to_string(),
            execution_condition: BASE64.encode(prepare.execution_condition),
            expires_at: prepare.expires_at.to_rfc3339(),
            data: BASE64.encode(&prepare.data),
            source_peer: from_peer_id.to_owned(),
        };

        let response = tokio::time::timeout(LOCAL_DELIVERY_DEFAULT_TIMEOUT, delivery.deliver(request)).await;
        match response {
            Ok(Some(response)) => match (response.fulfill, response.reject) {
                (Some(fulfill), _) => match decode_fulfillment(&fulfill.fulfillment, fulfill.data.as_deref()) {
                    Some(f) => Packet::Fulfill(f),
                    None => Packet::Reject(self.reject(ErrorCode::T00, "local delivery returned malformed fulfillment")),
                },
                (None, Some(reject)) => {
                    let code = ErrorCode::from_str(&reject.code).unwrap_or(ErrorCode::F99);
                    let data = reject
                        .data
                        .as_deref()
                        .and_then(|d| BASE64.decode(d).ok())
                        .unwrap_or_default();
                    Packet::Reject(
                        RejectBuilder {
                            code,
                            message: reject.message.as_bytes(),
                            triggered_by: Some(&self.node_address),
                            data: &data,
                        }
                        .build(),
                    )
                }
                (None, None) => Packet::Reject(self.reject(ErrorCode::T00, "local delivery returned neither fulfill nor reject")),
            },
            Ok(None) => Packet::Reject(self.reject(ErrorCode::T00, "local delivery failed")),
            Err(_) => Packet::Reject(self.reject(ErrorCode::T00, "local delivery timed out")),
        }
    }

    async fn forward(
        &self,
        prepare: &Prepare,
        from_peer_id: &str,
        next_hop: &str,
        correlation_id: &str,
        packet_id: &str,
    ) -> Result<Packet, BtpError> {
        let decremented_expiry = prepare.expires_at - chrono::Duration::from_std(EXPIRY_SAFETY_MARGIN).unwrap();
        if decremented_expiry <= Utc::now() {
            return Ok(Packet::Reject(
                self.reject(ErrorCode::R00, "Insufficient time remaining for forwarding"),
            ));
        }

        let forwarded_amount = if self.settlement.enabled {
            let fee = (prepare.amount as u128 * self.settlement.fee_basis_points as u128) / 10_000;
            let forwarded_amount = prepare.amount as u128 - fee;

            if let Err(e) = self
                .ledger
                .check_credit_limit(from_peer_id, SETTLEMENT_TOKEN, prepare.amount as u128)
                .await
            {
                return Ok(Packet::Reject(self.reject(ErrorCode::T04, e.credit_limit_message())));
            }

            let incoming_id = transfer_id(&prepare.execution_condition, self.node_address.as_str(), 0x01);
            let outgoing_id = transfer_id(&prepare.execution_condition, self.node_address.as_str(), 0x02);
            if let Err(e) = self
                .ledger
                .record_packet_transfers(
                    from_peer_id,
                    next_hop,
                    SETTLEMENT_TOKEN,
                    prepare.amount as u128,
                    forwarded_amount,
                    incoming_id,
                    outgoing_id,
                )
                .await
            {
                return Ok(Packet::Reject(
                    self.reject(ErrorCode::T00, format!("Settlement recording failed: {e}")),
                ));
            }

            forwarded_amount as u64
        } else {
            prepare.amount
        };

        let outgoing = Prepare {
            amount: forwarded_amount,
            expires_at: decremented_expiry,
            execution_condition: prepare.execution_condition,
            destination: prepare.destination.clone(),
            data: prepare.data.clone(),
        };

        let remaining = (decremented_expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let send_result = self
            .registry
            .send_to_peer(next_hop, ilp_protocol_data(&outgoing.to_bytes()), forwarding_timeout(remaining))
            .await;

        match send_result {
            Ok(response_packet) => {
                self.event_sink.emit(Event::PacketForwarded {
                    correlation_id: correlation_id.to_owned(),
                    packet_id: packet_id.to_owned(),
                    next_hop: next_hop.to_owned(),
                });
                let protocol_data = match response_packet {
                    interledger_btp::BtpPacket::Response(r) => r.protocol_data,
                    _ => return Err(BtpError::Connection("unexpected BTP frame in response to forwarded packet".into())),
                };
                let Some(ilp_bytes) = find_ilp_packet(&protocol_data) else {
                    return Err(BtpError::Connection("peer response carried no ILP packet".into()));
                };
                match Packet::from_bytes(ilp_bytes) {
                    Ok(packet @ (Packet::Fulfill(_) | Packet::Reject(_))) => Ok(packet),
                    Ok(Packet::Prepare(_)) | Err(_) => {
                        Err(BtpError::Connection("peer response did not carry a Fulfill or Reject".into()))
                    }
                }
            }
            Err(BtpError::Connection(_)) | Err(BtpError::Authentication(_)) => {
                Ok(Packet::Reject(self.reject(ErrorCode::T01, "peer unreachable")))
            }
            Err(BtpError::Timeout) => Ok(Packet::Reject(self.reject(ErrorCode::R00, "transfer timed out"))),
            Err(other) => Err(other),
        }
    }
}

fn decode_fulfillment(fulfillment_b64: &str, data_b64: Option<&str>) -> Option<Fulfill> {
    let fulfillment_bytes = BASE64.decode(fulfillment_b64).ok()?;
    let fulfillment: [u8; 32] = fulfillment_bytes.try_into().ok()?;
    let data = match data_b64 {
        Some(d) => bytes::Bytes::from(BASE64.decode(d).ok()?),
        None => bytes::Bytes::new(),
    };
    Some(Fulfill { fulfillment, data })
}

#[async_trait]
impl IncomingHandler for PacketHandler {
    async fn handle_message(
        &self,
        peer_id: &str,
        protocol_data: Vec<interledger_btp::ProtocolData>,
    ) -> InboundOutcome {
        let Some(ilp_bytes) = find_ilp_packet(&protocol_data) else {
            return InboundOutcome::Error {
                code: "F01".to_owned(),
                name: "InvalidPacketError".to_owned(),
                message: "MESSAGE frame carried no ILP packet".to_owned(),
            };
        };
        let prepare = match Packet::from_bytes(ilp_bytes) {
            Ok(Packet::Prepare(p)) => p,
            Ok(_) => {
                return InboundOutcome::Error {
                    code: "F01".to_owned(),
                    name: "InvalidPacketError".to_owned(),
                    message: "expected a Prepare packet".to_owned(),
                }
            }
            Err(e) => {
                return InboundOutcome::Error {
                    code: "F01".to_owned(),
                    name: "InvalidPacketError".to_owned(),
                    message: e.to_string(),
                }
            }
        };

        match self.handle_prepare_packet(prepare, peer_id).await {
            Ok(packet) => InboundOutcome::Response(ilp_protocol_data(&packet.to_bytes()).into_iter().collect()),
            Err(e) => {
                warn!(error = %e, "unclassified failure while forwarding Prepare");
                InboundOutcome::Error {
                    code: "F00".to_owned(),
                    name: "NotAcceptedError".to_owned(),
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use interledger_errors::LedgerError;
    use interledger_router::RoutingTable;
    use interledger_settlement::{CreditLimitConfig, InMemoryLedger, NullLedger, TransferLeg};
    use std::str::FromStr;

    fn sample_prepare(destination: &str, amount: u64) -> Prepare {
        Prepare {
            amount,
            expires_at: Utc::now() + chrono::Duration::seconds(10),
            execution_condition: [0xaa; 32],
            destination: Address::from_str(destination).unwrap(),
            data: bytes::Bytes::new(),
        }
    }

    fn test_handler(routing_table: RoutingTable, ledger: Arc<dyn Ledger>, settlement: SettlementSettings) -> PacketHandler {
        PacketHandler::new(
            Address::from_str("g.connector").unwrap(),
            Arc::new(routing_table),
            Arc::new(PeerRegistry::new()),
            ledger,
            None,
            settlement,
            Arc::new(NullEventSink),
        )
    }

    #[tokio::test]
    async fn no_route_rejects_with_f02_and_destination_in_message() {
        let handler = test_handler(RoutingTable::new(), Arc::new(NullLedger), SettlementSettings::disabled());
        let prepare = sample_prepare("g.alice.wallet", 1000);
        let packet = handler.handle_prepare_packet(prepare, "peerA").await.unwrap();
        match packet {
            Packet::Reject(r) => {
                assert_eq!(r.code, ErrorCode::F02);
                assert!(String::from_utf8_lossy(&r.message).contains("g.alice.wallet"));
                assert_eq!(r.triggered_by.unwrap().as_str(), "g.connector");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_prepare_rejects_with_r00() {
        let routes = RoutingTable::new();
        routes.add_route("g.alice", "peerA", 0);
        let handler = test_handler(routes, Arc::new(NullLedger), SettlementSettings::disabled());
        let mut prepare = sample_prepare("g.alice.wallet", 1000);
        prepare.expires_at = Utc::now() - chrono::Duration::seconds(5);
        let packet = handler.handle_prepare_packet(prepare, "peerA").await.unwrap();
        match packet {
            Packet::Reject(r) => {
                assert_eq!(r.code, ErrorCode::R00);
                assert_eq!(&r.message[..], b"Packet has expired");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_route_with_no_handler_stub_fulfills_with_the_condition() {
        let routes = RoutingTable::new();
        routes.add_route("g.connector", interledger_router::LOCAL_PEER_ID, 0);
        let handler = test_handler(routes, Arc::new(NullLedger), SettlementSettings::disabled());
        let prepare = sample_prepare("g.connector.accounts.alice", 1000);
        let condition = prepare.execution_condition;
        let packet = handler.handle_prepare_packet(prepare, "peerA").await.unwrap();
        match packet {
            Packet::Fulfill(f) => assert_eq!(f.fulfillment, condition),
            other => panic!("expected fulfill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn credit_limit_violation_rejects_with_t04_before_any_send() {
        let routes = RoutingTable::new();
        routes.add_route("g.alice", "peerB", 0);
        let mut limits = CreditLimitConfig::new();
        limits.set_peer_limit("peerA", 5000);
        let ledger = Arc::new(InMemoryLedger::new(limits));
        ledger
            .record_packet_transfers("peerA", "peerB", "ILP", 4500, 4500, 1, 2)
            .await
            .unwrap();
        let handler = test_handler(routes, ledger, SettlementSettings::enabled(0.0));
        let prepare = sample_prepare("g.alice.wallet", 600);
        let packet = handler.handle_prepare_packet(prepare, "peerA").await.unwrap();
        match packet {
            Packet::Reject(r) => {
                assert_eq!(r.code, ErrorCode::T04);
                let message = String::from_utf8_lossy(&r.message);
                assert!(message.contains("peerA"), "{message}");
                assert!(message.contains("100"), "{message}");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    struct FailingLedger;

    #[async_trait]
    impl Ledger for FailingLedger {
        async fn check_credit_limit(&self, _: &str, _: &str, _: u128) -> Result<(), LedgerError> {
            Ok(())
        }
        async fn record_packet_transfers(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: u128,
            _: u128,
            _: u128,
            _: u128,
        ) -> Result<Vec<TransferLeg>, LedgerError> {
            Err(LedgerError::RecordingFailed("store unavailable".into()))
        }
        async fn net_balance(&self, _: &str, _: &str) -> i128 {
            0
        }
        async fn debit_balance(&self, _: &str, _: &str) -> u128 {
            0
        }
    }

    #[tokio::test]
    async fn settlement_recording_failure_rejects_with_t00_and_no_forward() {
        let routes = RoutingTable::new();
        routes.add_route("g.alice", "peerB", 0);
        let handler = test_handler(routes, Arc::new(FailingLedger), SettlementSettings::enabled(0.1));
        let prepare = sample_prepare("g.alice.wallet", 1000);
        let packet = handler.handle_prepare_packet(prepare, "peerA").await.unwrap();
        match packet {
            Packet::Reject(r) => {
                assert_eq!(r.code, ErrorCode::T00);
                assert!(String::from_utf8_lossy(&r.message).contains("Settlement recording failed"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn fee_calculation_matches_basis_point_formula() {
        let settings = SettlementSettings::enabled(0.1);
        assert_eq!(settings.fee_basis_points, 10);
        let fee = (100_000u128 * settings.fee_basis_points as u128) / 10_000;
        assert_eq!(fee, 100);
        let fee_small = (999u128 * settings.fee_basis_points as u128) / 10_000;
        assert_eq!(fee_small, 0);
    }

    #[test]
    fn transfer_id_incoming_and_outgoing_legs_differ_only_in_low_byte() {
        let condition = [0x42; 32];
        let incoming = transfer_id(&condition, "g.connector", 0x01);
        let outgoing = transfer_id(&condition, "g.connector", 0x02);
        assert_ne!(incoming, outgoing);
        assert_eq!(incoming ^ outgoing, 0x03);
    }
}
