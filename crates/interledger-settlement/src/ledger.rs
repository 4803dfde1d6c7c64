use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use interledger_errors::LedgerError;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// One posted leg of a dual-leg transfer, returned for diagnostics/testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLeg {
    pub peer_id: String,
    pub token_id: String,
    pub transfer_id: u128,
    pub amount: u128,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns `Err(LedgerError::CreditLimitExceeded { .. })` if posting `proposed_amount`
    /// against `peer_id`'s debit-side balance would exceed its effective credit limit.
    async fn check_credit_limit(
        &self,
        peer_id: &str,
        token_id: &str,
        proposed_amount: u128,
    ) -> Result<(), LedgerError>;

    /// Atomically posts the incoming leg (debit, against `from_peer_id`) and the outgoing leg
    /// (credit, against `to_peer_id`). Retrying with the same `(incoming_id, outgoing_id)` pair
    /// is a no-op.
    #[allow(clippy::too_many_arguments)]
    async fn record_packet_transfers(
        &self,
        from_peer_id: &str,
        to_peer_id: &str,
        token_id: &str,
        incoming_amount: u128,
        outgoing_amount: u128,
        incoming_id: u128,
        outgoing_id: u128,
    ) -> Result<Vec<TransferLeg>, LedgerError>;

    /// Current `debit - credit` net balance for `(peer_id, token_id)`.
    async fn net_balance(&self, peer_id: &str, token_id: &str) -> i128;

    /// Current debit-side balance ("peer owes us") for `(peer_id, token_id)`.
    async fn debit_balance(&self, peer_id: &str, token_id: &str) -> u128;
}

#[derive(Debug, Default, Clone, Copy)]
struct Balances {
    debit: u128,
    credit: u128,
}

/// Three-level credit-limit lookup: token-specific per peer, then per peer, then a default,
/// capped by a global ceiling.
#[derive(Debug, Default, Clone)]
pub struct CreditLimitConfig {
    per_peer_token: HashMap<(String, String), u128>,
    per_peer: HashMap<String, u128>,
    default_limit: Option<u128>,
    global_ceiling: Option<u128>,
}

impl CreditLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_ceiling(mut self, ceiling: u128) -> Self {
        self.global_ceiling = Some(ceiling);
        self
    }

    pub fn with_default_limit(mut self, limit: u128) -> Self {
        self.default_limit = Some(limit);
        self
    }

    pub fn set_peer_limit(&mut self, peer_id: impl Into<String>, limit: u128) {
        self.per_peer.insert(peer_id.into(), limit);
    }

    pub fn set_peer_token_limit(
        &mut self,
        peer_id: impl Into<String>,
        token_id: impl Into<String>,
        limit: u128,
    ) {
        self.per_peer_token
            .insert((peer_id.into(), token_id.into()), limit);
    }

    /// `None` means unlimited (no limit configured at any level and no global ceiling).
    fn effective_limit(&self, peer_id: &str, token_id: &str) -> Option<u128> {
        let configured = self
            .per_peer_token
            .get(&(peer_id.to_owned(), token_id.to_owned()))
            .or_else(|| self.per_peer.get(peer_id))
            .or(self.default_limit.as_ref())
            .copied();

        match (configured, self.global_ceiling) {
            (Some(c), Some(g)) => Some(c.min(g)),
            (Some(c), None) => Some(c),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        }
    }
}

/// In-memory implementation of [`Ledger`]. Internally serialized by its own mutex, matching
/// the concurrency model's requirement that the ledger be self-synchronizing.
pub struct InMemoryLedger {
    balances: Mutex<HashMap<(String, String), Balances>>,
    recorded: Mutex<HashSet<(u128, u128)>>,
    credit_limits: CreditLimitConfig,
}

impl InMemoryLedger {
    pub fn new(credit_limits: CreditLimitConfig) -> Self {
        InMemoryLedger {
            balances: Mutex::new(HashMap::new()),
            recorded: Mutex::new(HashSet::new()),
            credit_limits,
        }
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn check_credit_limit(
        &self,
        peer_id: &str,
        token_id: &str,
        proposed_amount: u128,
    ) -> Result<(), LedgerError> {
        let Some(limit) = self.credit_limits.effective_limit(peer_id, token_id) else {
            return Ok(());
        };
        let current_balance = {
            let balances = self.balances.lock();
            balances
                .get(&(peer_id.to_owned(), token_id.to_owned()))
                .map(|b| b.debit)
                .unwrap_or_default()
        };
        let prospective = current_balance + proposed_amount;
        if prospective > limit {
            let would_exceed_by = prospective - limit;
            warn!(
                peer_id,
                token_id,
                current_balance = current_balance as u64,
                requested = proposed_amount as u64,
                limit = limit as u64,
                "credit limit would be exceeded"
            );
            return Err(LedgerError::CreditLimitExceeded {
                peer_id: peer_id.to_owned(),
                current_balance,
                requested_amount: proposed_amount,
                credit_limit: limit,
                would_exceed_by,
            });
        }
        Ok(())
    }

    async fn record_packet_transfers(
        &self,
        from_peer_id: &str,
        to_peer_id: &str,
        token_id: &str,
        incoming_amount: u128,
        outgoing_amount: u128,
        incoming_id: u128,
        outgoing_id: u128,
    ) -> Result<Vec<TransferLeg>, LedgerError> {
        let idempotency_key = (incoming_id, outgoing_id);
        {
            let mut recorded = self.recorded.lock();
            if !recorded.insert(idempotency_key) {
                debug!(incoming_id, outgoing_id, "transfer pair already recorded, no-op");
                return Ok(vec![]);
            }
        }

        let mut balances = self.balances.lock();
        balances
            .entry((from_peer_id.to_owned(), token_id.to_owned()))
            .or_default()
            .debit += incoming_amount;
        balances
            .entry((to_peer_id.to_owned(), token_id.to_owned()))
            .or_default()
            .credit += outgoing_amount;

        Ok(vec![
            TransferLeg {
                peer_id: from_peer_id.to_owned(),
                token_id: token_id.to_owned(),
                transfer_id: incoming_id,
                amount: incoming_amount,
            },
            TransferLeg {
                peer_id: to_peer_id.to_owned(),
                token_id: token_id.to_owned(),
                transfer_id: outgoing_id,
                amount: outgoing_amount,
            },
        ])
    }

    async fn net_balance(&self, peer_id: &str, token_id: &str) -> i128 {
        let balances = self.balances.lock();
        balances
            .get(&(peer_id.to_owned(), token_id.to_owned()))
            .map(|b| b.debit as i128 - b.credit as i128)
            .unwrap_or_default()
    }

    async fn debit_balance(&self, peer_id: &str, token_id: &str) -> u128 {
        let balances = self.balances.lock();
        balances
            .get(&(peer_id.to_owned(), token_id.to_owned()))
            .map(|b| b.debit)
            .unwrap_or_default()
    }
}

/// No-op fallback used when no backing accounting store is configured: credit-limit checks
/// never fail, recording is a no-op, and balances report zero. Packet forwarding still works.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLedger;

#[async_trait]
impl Ledger for NullLedger {
    async fn check_credit_limit(
        &self,
        _peer_id: &str,
        _token_id: &str,
        _proposed_amount: u128,
    ) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn record_packet_transfers(
        &self,
        _from_peer_id: &str,
        _to_peer_id: &str,
        _token_id: &str,
        _incoming_amount: u128,
        _outgoing_amount: u128,
        _incoming_id: u128,
        _outgoing_id: u128,
    ) -> Result<Vec<TransferLeg>, LedgerError> {
        Ok(vec![])
    }

    async fn net_balance(&self, _peer_id: &str, _token_id: &str) -> i128 {
        0
    }

    async fn debit_balance(&self, _peer_id: &str, _token_id: &str) -> u128 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credit_limit_violation_reports_excess() {
        let mut limits = CreditLimitConfig::new();
        limits.set_peer_limit("peerA", 5000);
        let ledger = InMemoryLedger::new(limits);
        ledger
            .record_packet_transfers("peerA", "peerB", "ILP", 4500, 4500, 1, 2)
            .await
            .unwrap();

        let err = ledger
            .check_credit_limit("peerA", "ILP", 600)
            .await
            .unwrap_err();
        match err {
            LedgerError::CreditLimitExceeded {
                would_exceed_by, ..
            } => assert_eq!(would_exceed_by, 100),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn global_ceiling_caps_configured_limit() {
        let limits = CreditLimitConfig::new()
            .with_default_limit(10_000)
            .with_global_ceiling(1_000);
        let ledger = InMemoryLedger::new(limits);
        let err = ledger
            .check_credit_limit("peerA", "ILP", 1_001)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CreditLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn unlimited_when_unconfigured() {
        let ledger = InMemoryLedger::new(CreditLimitConfig::new());
        ledger
            .check_credit_limit("peerA", "ILP", u128::MAX / 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn record_packet_transfers_is_atomic_and_idempotent() {
        let ledger = InMemoryLedger::new(CreditLimitConfig::new());
        let legs = ledger
            .record_packet_transfers("peerA", "peerB", "ILP", 100, 99, 11, 22)
            .await
            .unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(ledger.debit_balance("peerA", "ILP").await, 100);
        assert_eq!(ledger.net_balance("peerB", "ILP").await, -99);

        // retry with the same ids is a no-op
        let legs = ledger
            .record_packet_transfers("peerA", "peerB", "ILP", 100, 99, 11, 22)
            .await
            .unwrap();
        assert!(legs.is_empty());
        assert_eq!(ledger.debit_balance("peerA", "ILP").await, 100);
    }

    #[tokio::test]
    async fn null_ledger_never_violates_and_forwards_freely() {
        let ledger = NullLedger;
        ledger.check_credit_limit("any", "ILP", u128::MAX).await.unwrap();
        let legs = ledger
            .record_packet_transfers("a", "b", "ILP", 1, 1, 1, 2)
            .await
            .unwrap();
        assert!(legs.is_empty());
        assert_eq!(ledger.debit_balance("a", "ILP").await, 0);
    }
}
