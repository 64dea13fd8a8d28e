//! Error taxonomy
//!
//! One enum per boundary: the currency node (`ChainError`), the main server
//! channel (`RemoteError`), the ledger store (`StoreError`) and the connector
//! as a whole (`ConnectorError`).

use thiserror::Error;

use crate::ledger::types::Opid;

/// Failures reported by a currency client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Node or event source could not be reached. Retryable.
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// The node rejected the send before broadcasting it.
    #[error("Definitely not sent: {0}")]
    DefinitelyNotSent(String),

    /// The send may or may not have been broadcast.
    #[error("Send outcome unknown: {0}")]
    Ambiguous(String),

    #[error("Capability not supported: {0}")]
    Unsupported(&'static str),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ChainError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::NodeUnreachable(_))
    }
}

/// Typed responses from the main server channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Main server channel disconnected")]
    Disconnected,

    #[error("Main server has no account {0}")]
    UnknownAccount(String),

    #[error("Duplicate operation, main server already has opid {opid}")]
    DuplicateOperation { opid: Opid },

    #[error("Operation not found on main server")]
    OperationNotFound,

    #[error("Rejected by main server: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store transaction already finished")]
    TransactionClosed,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Main server error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Withdrawal {0} already executed")]
    AlreadyExecuted(Opid),

    #[error("Unknown operation {0}")]
    UnknownOperation(Opid),

    #[error("Duplicate withdrawal request {0}")]
    DuplicateRequest(Opid),

    #[error("Unknown account {0}")]
    UnknownAccount(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Conditions the embedding process must act on, published by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Local state may no longer match the chain; the process should exit.
    Fatal(String),
    /// Withdrawal execution stopped after a send the node refused.
    Halted(ChainError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_node_unreachable_is_retryable() {
        assert!(ChainError::NodeUnreachable("down".into()).is_retryable());
        assert!(!ChainError::DefinitelyNotSent("no funds".into()).is_retryable());
        assert!(!ChainError::Ambiguous("timeout".into()).is_retryable());
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let msgs = [
            RemoteError::Disconnected.to_string(),
            RemoteError::UnknownAccount("a".into()).to_string(),
            RemoteError::DuplicateOperation {
                opid: Opid::from("x"),
            }
            .to_string(),
            RemoteError::OperationNotFound.to_string(),
        ];
        for (i, a) in msgs.iter().enumerate() {
            for b in msgs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_connector_error_from_chain() {
        let err: ConnectorError = ChainError::DefinitelyNotSent("insufficient funds".into()).into();
        assert!(matches!(
            err,
            ConnectorError::Chain(ChainError::DefinitelyNotSent(_))
        ));
    }
}
