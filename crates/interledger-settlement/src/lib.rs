//! Dual-leg accounting ledger, credit-limit enforcement, and the settlement threshold monitor.

mod ledger;
mod monitor;

pub use ledger::{
    CreditLimitConfig, InMemoryLedger, Ledger, NullLedger, TransferLeg,
};
pub use monitor::{
    ChannelEventSink, LogEventSink, NullExecutor, SettlementEvent, SettlementEventSink,
    SettlementExecutor, SettlementMonitor, SettlementState, ThresholdConfig,
};
