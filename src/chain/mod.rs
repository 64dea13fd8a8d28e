//! Currency Client Capabilities
//!
//! The engine never talks to a node directly. Each currency supplies one
//! `CurrencyClient` implementation; optional capabilities report
//! `ChainError::Unsupported` by default.

pub mod btc;

pub use btc::BitcoindClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::ChainError;
use crate::ledger::types::TxStatus;

/// Result of a broadcast send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub txid: String,
    pub confirmations: Option<u32>,
    pub status: TxStatus,
    /// Chain-reported execution time, ms since epoch
    pub timestamp: i64,
}

/// Node reachability check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub height: u64,
    pub best_block: String,
}

/// One movement inside a chain transaction, as seen by our wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEntry {
    pub txid: String,
    pub account: String,
    pub category: EntryCategory,
    /// Always positive
    pub amount: Decimal,
    pub confirmations: Option<u32>,
    /// ms since epoch
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCategory {
    Receive,
    Send,
    /// Coinbase, orphan and other categories the ledger ignores
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub txid: String,
    pub confirmations: Option<u32>,
    pub time: i64,
    pub entries: Vec<TransferEntry>,
}

/// Kind of block in an account chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Receive,
    Send,
    Other,
}

/// A block of an account chain (block-lattice currencies)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: String,
    /// Account chain this block belongs to
    pub account: String,
    pub previous: Option<String>,
    pub kind: BlockKind,
    pub amount: Decimal,
    pub confirmed: bool,
    /// ms since epoch
    pub timestamp: i64,
}

impl BlockInfo {
    pub fn is_confirmed_receive_into(&self, account: &str) -> bool {
        self.kind == BlockKind::Receive && self.confirmed && self.account == account
    }
}

/// Result of a since-block history query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinceBlock {
    pub entries: Vec<TransferEntry>,
    pub last_block: String,
}

/// How a currency exposes its history to the rewind procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Per-account chains walked backward from a frontier (block lattice)
    AccountChain,
    /// Wallet-wide listing of transactions since a block marker
    SinceBlock,
}

/// A deposit notification from the inbound event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositEvent {
    pub txid: String,
    pub account: String,
    pub amount: Decimal,
    pub confirmations: Option<u32>,
    /// ms since epoch
    pub time: i64,
}

impl From<&TransferEntry> for DepositEvent {
    fn from(entry: &TransferEntry) -> Self {
        Self {
            txid: entry.txid.clone(),
            account: entry.account.clone(),
            amount: entry.amount,
            confirmations: entry.confirmations,
            time: entry.time,
        }
    }
}

impl From<&BlockInfo> for DepositEvent {
    fn from(block: &BlockInfo) -> Self {
        Self {
            txid: block.hash.clone(),
            account: block.account.clone(),
            amount: block.amount,
            confirmations: None,
            time: block.timestamp,
        }
    }
}

/// Push notifications delivered by the currency's event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Deposit(DepositEvent),
    /// Bare txid notification; resolved through `transaction_info`
    TransactionNotify { txid: String },
    TransactionUpdate {
        txid: String,
        confirmations: Option<u32>,
        time: Option<i64>,
    },
    NewBlock { height: u64 },
}

/// Capability set implemented once per currency
#[async_trait]
pub trait CurrencyClient: Send + Sync {
    /// Currency code for logging (e.g. "BTC")
    fn currency(&self) -> &str;

    /// Reachability check
    async fn ping(&self) -> Result<NodeStatus, ChainError>;

    /// Allocate a new deposit address
    async fn create_account(&self) -> Result<String, ChainError>;

    async fn send_one(&self, account: &str, amount: Decimal) -> Result<SendReceipt, ChainError>;

    fn supports_send_many(&self) -> bool {
        false
    }

    async fn send_many(
        &self,
        _outputs: &BTreeMap<String, Decimal>,
    ) -> Result<SendReceipt, ChainError> {
        Err(ChainError::Unsupported("send_many"))
    }

    async fn transaction_info(&self, txid: &str) -> Result<TransactionInfo, ChainError>;

    fn history_mode(&self) -> HistoryMode;

    /// Latest block of an account chain, `None` if the account is unopened
    async fn account_frontier(&self, _account: &str) -> Result<Option<String>, ChainError> {
        Err(ChainError::Unsupported("account_frontier"))
    }

    async fn block_info(&self, _block: &str) -> Result<BlockInfo, ChainError> {
        Err(ChainError::Unsupported("block_info"))
    }

    async fn list_since_block(
        &self,
        _block: Option<&str>,
        _target_confirmations: u32,
    ) -> Result<SinceBlock, ChainError> {
        Err(ChainError::Unsupported("list_since_block"))
    }
}
