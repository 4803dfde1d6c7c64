use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::ledger::Ledger;

/// Per-(peer, token) settlement state. Transitions only ever go
/// `Idle -> SettlementPending -> SettlementInProgress -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Idle,
    SettlementPending,
    SettlementInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEvent {
    pub peer_id: String,
    pub token_id: String,
    pub balance: i128,
    pub threshold: i128,
}

/// Receives `SETTLEMENT_REQUIRED` notifications. Emitted only on the `Idle -> exceeds`
/// transition, never on every poll tick while already pending or in progress.
pub trait SettlementEventSink: Send + Sync {
    fn settlement_required(&self, event: SettlementEvent);
}

/// Logs the event and nothing else; the default when no executor is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl SettlementEventSink for LogEventSink {
    fn settlement_required(&self, event: SettlementEvent) {
        info!(
            peer_id = %event.peer_id,
            token_id = %event.token_id,
            balance = event.balance as i64,
            threshold = event.threshold as i64,
            "SETTLEMENT_REQUIRED"
        );
    }
}

/// Fans settlement events out over a broadcast channel for external subscribers (e.g. an
/// admin API or test harness) in addition to whatever an executor does with them.
pub struct ChannelEventSink {
    sender: broadcast::Sender<SettlementEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<SettlementEvent>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (ChannelEventSink { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.sender.subscribe()
    }
}

impl SettlementEventSink for ChannelEventSink {
    fn settlement_required(&self, event: SettlementEvent) {
        // No subscribers is a normal, common case; dropping the event is fine.
        let _ = self.sender.send(event);
    }
}

/// Executes a settlement once `SETTLEMENT_REQUIRED` fires. On-chain/off-chain settlement
/// execution itself is out of scope; this seam exists so the monitor's state machine can be
/// exercised and wired to a real payment rail later.
#[async_trait]
pub trait SettlementExecutor: Send + Sync {
    async fn execute_settlement(&self, peer_id: &str, token_id: &str, amount: u128);
}

/// Does nothing. The monitor still runs its full state machine and emits events; only the
/// act of moving funds is absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExecutor;

#[async_trait]
impl SettlementExecutor for NullExecutor {
    async fn execute_settlement(&self, _peer_id: &str, _token_id: &str, _amount: u128) {}
}

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    /// Net balance, per `(peer_id, token_id)`, above which settlement is required.
    pub thresholds: HashMap<(String, String), i128>,
    pub poll_interval: Duration,
}

impl ThresholdConfig {
    pub fn new(poll_interval: Duration) -> Self {
        ThresholdConfig {
            thresholds: HashMap::new(),
            poll_interval,
        }
    }

    pub fn set_threshold(&mut self, peer_id: impl Into<String>, token_id: impl Into<String>, threshold: i128) {
        self.thresholds.insert((peer_id.into(), token_id.into()), threshold);
    }
}

/// Cooperative polling task: on each tick, checks every configured `(peer, token)` pair's
/// net balance against its threshold and drives that pair's state machine.
pub struct SettlementMonitor<L: ?Sized, E, S> {
    ledger: Arc<L>,
    executor: Arc<E>,
    sink: Arc<S>,
    config: ThresholdConfig,
    states: Mutex<HashMap<(String, String), SettlementState>>,
}

impl<L, E, S> SettlementMonitor<L, E, S>
where
    L: Ledger + ?Sized + 'static,
    E: SettlementExecutor + 'static,
    S: SettlementEventSink + 'static,
{
    pub fn new(ledger: Arc<L>, executor: Arc<E>, sink: Arc<S>, config: ThresholdConfig) -> Self {
        SettlementMonitor {
            ledger,
            executor,
            sink,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_of(&self, peer_id: &str, token_id: &str) -> SettlementState {
        self.states
            .lock()
            .get(&(peer_id.to_owned(), token_id.to_owned()))
            .copied()
            .unwrap_or(SettlementState::Idle)
    }

    /// Runs the poll loop until the supplied signal resolves. Intended to be spawned as a
    /// background tokio task by the node's startup sequence.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("settlement monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn poll_once(&self) {
        let pairs: Vec<(String, String)> = self.config.thresholds.keys().cloned().collect();
        for (peer_id, token_id) in pairs {
            self.poll_pair(&peer_id, &token_id).await;
        }
    }

    async fn poll_pair(&self, peer_id: &str, token_id: &str) {
        let threshold = match self.config.thresholds.get(&(peer_id.to_owned(), token_id.to_owned())) {
            Some(t) => *t,
            None => return,
        };
        let balance = self.ledger.net_balance(peer_id, token_id).await;
        let exceeds = balance > threshold;

        let previous = self.state_of(peer_id, token_id);
        let next = match (previous, exceeds) {
            (SettlementState::Idle, true) => SettlementState::SettlementPending,
            (SettlementState::Idle, false) => SettlementState::Idle,
            (SettlementState::SettlementPending, _) => SettlementState::SettlementInProgress,
            (SettlementState::SettlementInProgress, _) => SettlementState::Idle,
        };

        if next != previous {
            debug!(peer_id, token_id, ?previous, ?next, "settlement state transition");
            self.states
                .lock()
                .insert((peer_id.to_owned(), token_id.to_owned()), next);
        }

        match (previous, next) {
            (SettlementState::Idle, SettlementState::SettlementPending) => {
                self.sink.settlement_required(SettlementEvent {
                    peer_id: peer_id.to_owned(),
                    token_id: token_id.to_owned(),
                    balance,
                    threshold,
                });
            }
            (SettlementState::SettlementPending, SettlementState::SettlementInProgress) => {
                let amount = balance.max(0) as u128;
                self.executor.execute_settlement(peer_id, token_id, amount).await;
            }
            (SettlementState::SettlementInProgress, SettlementState::Idle) => {
                debug!(peer_id, token_id, "settlement cycle complete");
            }
            _ => {}
        }

        if exceeds && previous == SettlementState::SettlementInProgress {
            warn!(peer_id, token_id, "balance still exceeds threshold after settlement cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CreditLimitConfig, InMemoryLedger};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<SettlementEvent>>,
    }

    impl SettlementEventSink for RecordingSink {
        fn settlement_required(&self, event: SettlementEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn emits_settlement_required_only_on_idle_transition() {
        let ledger = Arc::new(InMemoryLedger::new(CreditLimitConfig::new()));
        ledger
            .record_packet_transfers("peerA", "local", "ILP", 1_500, 1_500, 1, 2)
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let mut config = ThresholdConfig::new(Duration::from_secs(60));
        config.set_threshold("peerA", "ILP", 1_000);
        let monitor = SettlementMonitor::new(ledger, Arc::new(NullExecutor), sink.clone(), config);

        monitor.poll_once().await;
        assert_eq!(monitor.state_of("peerA", "ILP"), SettlementState::SettlementPending);
        assert_eq!(sink.events.lock().unwrap().len(), 1);

        // still exceeds, but we're past Idle now: no duplicate event, moves to InProgress
        monitor.poll_once().await;
        assert_eq!(monitor.state_of("peerA", "ILP"), SettlementState::SettlementInProgress);
        assert_eq!(sink.events.lock().unwrap().len(), 1);

        // cycle completes, back to Idle
        monitor.poll_once().await;
        assert_eq!(monitor.state_of("peerA", "ILP"), SettlementState::Idle);
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn below_threshold_never_transitions() {
        let ledger = Arc::new(InMemoryLedger::new(CreditLimitConfig::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut config = ThresholdConfig::new(Duration::from_secs(60));
        config.set_threshold("peerA", "ILP", 1_000);
        let monitor = SettlementMonitor::new(ledger, Arc::new(NullExecutor), sink.clone(), config);

        monitor.poll_once().await;
        assert_eq!(monitor.state_of("peerA", "ILP"), SettlementState::Idle);
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
