//! Outbound contract to the main server
//!
//! The transport (framing, reconnection) lives in the embedding process; the
//! engine only sees typed results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::ledger::{Opid, Transaction, TxStatus};

/// Confirmation progress of an acknowledged receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveUpdate {
    pub opid: Opid,
    pub txid: String,
    pub account: String,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
}

/// Execution progress of a withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendUpdate {
    pub opid: Opid,
    pub txid: String,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    pub timestamp: i64,
}

#[async_trait]
pub trait MainServer: Send + Sync {
    /// Report a new receive; returns the opid the main server assigned
    async fn new_transaction(&self, tx: &Transaction) -> Result<Opid, RemoteError>;

    async fn update_received_tx(&self, update: &ReceiveUpdate) -> Result<(), RemoteError>;

    async fn update_sent_tx(&self, update: &SendUpdate) -> Result<(), RemoteError>;
}
