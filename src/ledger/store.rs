//! Ledger persistence contract
//!
//! `LedgerStore` is the only shared mutable state of a connector. The
//! send-side state machine is serialized by `ExecutionTx`: while one is open,
//! cancellations of its claimed records wait for it to finish.

use async_trait::async_trait;

use super::types::{Account, Direction, Opid, PendingDelivery, Transaction, TxKey, TxStatus};
use crate::chain::SendReceipt;
use crate::error::StoreError;

/// Result of a cancellation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The record already left `requested`
    AlreadyExecuted,
    NotFound,
}

/// What `purge_account` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub account_removed: bool,
    pub transactions: usize,
    pub pending: usize,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // === Accounts ===

    /// Returns false if the account already exists
    async fn insert_account(&self, account: &Account) -> Result<bool, StoreError>;

    async fn get_account(&self, address: &str) -> Result<Option<Account>, StoreError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    async fn set_last_block(&self, address: &str, block: &str) -> Result<(), StoreError>;

    /// Remove an account with every transaction and outbox entry referencing it
    async fn purge_account(&self, address: &str) -> Result<PurgeReport, StoreError>;

    /// Module-wide history marker (since-block currencies)
    async fn chain_marker(&self) -> Result<Option<String>, StoreError>;

    async fn set_chain_marker(&self, block: &str) -> Result<(), StoreError>;

    // === Transactions ===

    /// Insert a receive. Returns false if (txid, account) already exists.
    async fn insert_receive(&self, tx: &Transaction) -> Result<bool, StoreError>;

    /// Insert a withdrawal request. Returns false if the opid already exists.
    async fn insert_request(&self, tx: &Transaction) -> Result<bool, StoreError>;

    async fn get(&self, key: &TxKey) -> Result<Option<Transaction>, StoreError>;

    /// All records of one direction carrying `txid`, in insertion order
    async fn find_by_txid(
        &self,
        txid: &str,
        direction: Direction,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Overwrite the mutable fields of an existing record.
    /// A stored opid or `completed` flag is never cleared.
    async fn update(&self, tx: &Transaction) -> Result<(), StoreError>;

    async fn set_opid(&self, key: &TxKey, opid: &Opid) -> Result<(), StoreError>;

    /// Set `completed`; a no-op unless the record is confirmed
    async fn mark_completed(&self, key: &TxKey) -> Result<bool, StoreError>;

    async fn delete(&self, key: &TxKey) -> Result<bool, StoreError>;

    /// Delete a withdrawal only while it is still requested
    async fn cancel_request(&self, opid: &Opid) -> Result<CancelOutcome, StoreError>;

    /// Opids of sends still requested, in insertion order
    async fn requested_sends(&self) -> Result<Vec<Opid>, StoreError>;

    /// Records with `completed = false` and status other than requested, in insertion order
    async fn unsynced(&self) -> Result<Vec<Transaction>, StoreError>;

    // === Outbox ===

    /// Insert or replace; an existing entry's attempt counter is incremented
    async fn put_pending(&self, entry: &PendingDelivery) -> Result<(), StoreError>;

    async fn delete_pending(&self, key: &TxKey) -> Result<bool, StoreError>;

    async fn list_pending(&self) -> Result<Vec<PendingDelivery>, StoreError>;

    // === Withdrawal execution ===

    async fn begin_execution(&self) -> Result<Box<dyn ExecutionTx>, StoreError>;
}

/// Store-level transaction around read-verify-execute-persist.
///
/// Dropping without `commit` rolls back.
#[async_trait]
pub trait ExecutionTx: Send {
    /// Lock and return the members still `requested`, in insertion order
    async fn claim_requested(&mut self, opids: &[Opid]) -> Result<Vec<Transaction>, StoreError>;

    /// Persist a send outcome onto a claimed record
    async fn record_sent(
        &mut self,
        opid: &Opid,
        receipt: &SendReceipt,
    ) -> Result<Transaction, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// True if a record needs to be (re)reported to the main server
pub fn needs_sync(tx: &Transaction) -> bool {
    !tx.completed && tx.status != TxStatus::Requested
}
