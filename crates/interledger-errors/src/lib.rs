//! Error types shared across the BTP transport, the ledger, and the packet handler.
//!
//! These are the "boxes" that get thrown internally; the packet handler is the only
//! place that converts them into an ILP [`Reject`](interledger_packet::Reject) (see
//! `interledger-service`'s error-mapping table, mirroring the taxonomy of codes in
//! the connector spec).

use interledger_packet::PacketError;

/// Errors raised by a BTP endpoint while sending to, or receiving from, a peer.
#[derive(Debug, thiserror::Error)]
pub enum BtpError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("request timed out")]
    Timeout,
    #[error("BTP frame parse error: {0}")]
    Parse(#[from] PacketError),
    #[error("peer sent BTP ERROR: {code} {message}")]
    Remote { code: String, message: String },
    #[error("too many requests in flight on this connection")]
    Overloaded,
}

/// Errors raised by the settlement ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("credit limit exceeded for peer {peer_id}: would owe {would_exceed_by} over limit of {credit_limit}")]
    CreditLimitExceeded {
        peer_id: String,
        current_balance: u128,
        requested_amount: u128,
        credit_limit: u128,
        would_exceed_by: u128,
    },
    #[error("settlement recording failed: {0}")]
    RecordingFailed(String),
}

impl LedgerError {
    pub fn credit_limit_message(&self) -> String {
        match self {
            LedgerError::CreditLimitExceeded {
                peer_id,
                would_exceed_by,
                credit_limit,
                ..
            } => format!(
                "Credit limit exceeded: peer {peer_id} would owe {would_exceed_by} units over limit of {credit_limit}"
            ),
            LedgerError::RecordingFailed(msg) => msg.clone(),
        }
    }
}
