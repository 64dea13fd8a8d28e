//! In-process ledger store
//!
//! Every operation runs under one async mutex, held only for the duration of
//! the call. An `ExecutionTx` instead marks the withdrawals it claims; writes
//! are staged and applied on commit. A claimed withdrawal cannot be claimed
//! again and cancelling it waits until the claim is released.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::store::{CancelOutcome, ExecutionTx, LedgerStore, PurgeReport, needs_sync};
use super::types::{Account, Direction, Opid, PendingDelivery, Transaction, TxKey, TxStatus};
use crate::chain::SendReceipt;
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct LedgerState {
    next_seq: u64,
    accounts: BTreeMap<String, Account>,
    /// Keyed by insertion sequence
    transactions: BTreeMap<u64, Transaction>,
    pending: BTreeMap<TxKey, PendingDelivery>,
    chain_marker: Option<String>,
}

impl LedgerState {
    fn seq_of(&self, key: &TxKey) -> Option<u64> {
        self.transactions
            .iter()
            .find(|(_, tx)| tx.key().ok().as_ref() == Some(key))
            .map(|(seq, _)| *seq)
    }

    fn get_mut(&mut self, key: &TxKey) -> Option<&mut Transaction> {
        let seq = self.seq_of(key)?;
        self.transactions.get_mut(&seq)
    }

    fn insert(&mut self, tx: &Transaction) -> Result<bool, StoreError> {
        tx.validate()?;
        let key = tx.key()?;
        if self.seq_of(&key).is_some() {
            return Ok(false);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.transactions.insert(seq, tx.clone());
        Ok(true)
    }

    fn send_by_opid(&mut self, opid: &Opid) -> Option<&mut Transaction> {
        self.transactions
            .values_mut()
            .find(|tx| tx.direction == Direction::Send && tx.opid.as_ref() == Some(opid))
    }
}

/// Withdrawals held by open executions
#[derive(Default)]
struct Claims {
    held: SyncMutex<BTreeSet<Opid>>,
    released: Notify,
}

impl Claims {
    fn lock(&self) -> MutexGuard<'_, BTreeSet<Opid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, opids: &[Opid]) {
        if opids.is_empty() {
            return;
        }
        let mut held = self.lock();
        for opid in opids {
            held.remove(opid);
        }
        drop(held);
        self.released.notify_waiters();
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<LedgerState>>,
    claims: Arc<Claims>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.address) {
            return Ok(false);
        }
        state
            .accounts
            .insert(account.address.clone(), account.clone());
        Ok(true)
    }

    async fn get_account(&self, address: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.state.lock().await.accounts.get(address).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.state.lock().await.accounts.values().cloned().collect())
    }

    async fn set_last_block(&self, address: &str, block: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.accounts.get_mut(address) {
            Some(account) => {
                account.last_block = Some(block.to_string());
                Ok(())
            }
            None => Err(StoreError::Constraint(format!("no account {}", address))),
        }
    }

    async fn purge_account(&self, address: &str) -> Result<PurgeReport, StoreError> {
        let mut state = self.state.lock().await;
        let account_removed = state.accounts.remove(address).is_some();

        let before = state.transactions.len();
        state.transactions.retain(|_, tx| tx.account != address);
        let transactions = before - state.transactions.len();

        let before = state.pending.len();
        state.pending.retain(|_, p| p.account != address);
        let pending = before - state.pending.len();

        Ok(PurgeReport {
            account_removed,
            transactions,
            pending,
        })
    }

    async fn chain_marker(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.chain_marker.clone())
    }

    async fn set_chain_marker(&self, block: &str) -> Result<(), StoreError> {
        self.state.lock().await.chain_marker = Some(block.to_string());
        Ok(())
    }

    async fn insert_receive(&self, tx: &Transaction) -> Result<bool, StoreError> {
        if tx.direction != Direction::Receive {
            return Err(StoreError::Invariant("insert_receive given a send".into()));
        }
        self.state.lock().await.insert(tx)
    }

    async fn insert_request(&self, tx: &Transaction) -> Result<bool, StoreError> {
        if tx.direction != Direction::Send || tx.status != TxStatus::Requested {
            return Err(StoreError::Invariant(
                "insert_request needs a requested send".into(),
            ));
        }
        self.state.lock().await.insert(tx)
    }

    async fn get(&self, key: &TxKey) -> Result<Option<Transaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .seq_of(key)
            .and_then(|seq| state.transactions.get(&seq).cloned()))
    }

    async fn find_by_txid(
        &self,
        txid: &str,
        direction: Direction,
    ) -> Result<Vec<Transaction>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .values()
            .filter(|tx| tx.direction == direction && tx.txid.as_deref() == Some(txid))
            .cloned()
            .collect())
    }

    async fn update(&self, tx: &Transaction) -> Result<(), StoreError> {
        tx.validate()?;
        let key = tx.key()?;
        let mut state = self.state.lock().await;
        let current = state
            .get_mut(&key)
            .ok_or_else(|| StoreError::Constraint(format!("no record {}", key)))?;
        if !current.status.can_transition_to(tx.status) {
            return Err(StoreError::Invariant(format!(
                "{}: {} -> {}",
                key, current.status, tx.status
            )));
        }
        if tx.opid.is_some() {
            current.opid = tx.opid.clone();
        }
        current.txid = tx.txid.clone();
        current.status = tx.status;
        current.confirmations = tx.confirmations;
        current.timestamp = tx.timestamp;
        current.completed |= tx.completed;
        Ok(())
    }

    async fn set_opid(&self, key: &TxKey, opid: &Opid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let tx = state
            .get_mut(key)
            .ok_or_else(|| StoreError::Constraint(format!("no record {}", key)))?;
        tx.opid = Some(opid.clone());
        Ok(())
    }

    async fn mark_completed(&self, key: &TxKey) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.get_mut(key).is_some_and(|tx| tx.mark_completed()))
    }

    async fn delete(&self, key: &TxKey) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.seq_of(key) {
            Some(seq) => {
                state.transactions.remove(&seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_request(&self, opid: &Opid) -> Result<CancelOutcome, StoreError> {
        // Claims are only taken under the state lock
        let mut state = loop {
            let released = self.claims.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let state = self.state.lock().await;
            if !self.claims.lock().contains(opid) {
                break state;
            }
            drop(state);
            debug!(opid = %opid, "Cancel waiting for in-flight execution");
            released.await;
        };
        let key = TxKey::Send { opid: opid.clone() };
        let Some(seq) = state.seq_of(&key) else {
            return Ok(CancelOutcome::NotFound);
        };
        match state.transactions.get(&seq).map(|tx| tx.status) {
            Some(TxStatus::Requested) => {
                state.transactions.remove(&seq);
                Ok(CancelOutcome::Cancelled)
            }
            Some(_) => Ok(CancelOutcome::AlreadyExecuted),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn requested_sends(&self) -> Result<Vec<Opid>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .values()
            .filter(|tx| tx.direction == Direction::Send && tx.status == TxStatus::Requested)
            .filter_map(|tx| tx.opid.clone())
            .collect())
    }

    async fn unsynced(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .values()
            .filter(|tx| needs_sync(tx))
            .cloned()
            .collect())
    }

    async fn put_pending(&self, entry: &PendingDelivery) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = entry.key();
        let attempts = state
            .pending
            .get(&key)
            .map(|p| p.attempts + 1)
            .unwrap_or(entry.attempts);
        let mut entry = entry.clone();
        entry.attempts = attempts;
        state.pending.insert(key, entry);
        Ok(())
    }

    async fn delete_pending(&self, key: &TxKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.pending.remove(key).is_some())
    }

    async fn list_pending(&self) -> Result<Vec<PendingDelivery>, StoreError> {
        Ok(self.state.lock().await.pending.values().cloned().collect())
    }

    async fn begin_execution(&self) -> Result<Box<dyn ExecutionTx>, StoreError> {
        Ok(Box::new(MemoryExecution {
            state: self.state.clone(),
            claims: self.claims.clone(),
            claimed: Vec::new(),
            staged: BTreeMap::new(),
            open: true,
        }))
    }
}

struct MemoryExecution {
    state: Arc<Mutex<LedgerState>>,
    claims: Arc<Claims>,
    claimed: Vec<Opid>,
    staged: BTreeMap<Opid, Transaction>,
    open: bool,
}

impl MemoryExecution {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.staged.clear();
        let claimed = std::mem::take(&mut self.claimed);
        self.claims.release(&claimed);
    }
}

#[async_trait]
impl ExecutionTx for MemoryExecution {
    async fn claim_requested(&mut self, opids: &[Opid]) -> Result<Vec<Transaction>, StoreError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let mut held = self.claims.lock();
        let claimed: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.direction == Direction::Send
                    && tx.status == TxStatus::Requested
                    && tx
                        .opid
                        .as_ref()
                        .is_some_and(|o| opids.contains(o) && !held.contains(o))
            })
            .cloned()
            .collect();
        for opid in claimed.iter().filter_map(|tx| tx.opid.clone()) {
            held.insert(opid.clone());
            self.claimed.push(opid);
        }
        Ok(claimed)
    }

    async fn record_sent(
        &mut self,
        opid: &Opid,
        receipt: &SendReceipt,
    ) -> Result<Transaction, StoreError> {
        self.ensure_open()?;
        if !self.claimed.contains(opid) {
            return Err(StoreError::Constraint(format!("withdrawal {} not claimed", opid)));
        }
        let mut updated = match self.staged.get(opid) {
            Some(tx) => tx.clone(),
            None => self
                .state
                .lock()
                .await
                .send_by_opid(opid)
                .cloned()
                .ok_or_else(|| StoreError::Constraint(format!("no withdrawal {}", opid)))?,
        };
        updated.apply_receipt(receipt)?;
        updated.validate()?;
        self.staged.insert(opid.clone(), updated.clone());
        Ok(updated)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let staged = std::mem::take(&mut self.staged);
        let result = {
            let mut state = self.state.lock().await;
            // Check every member first so a commit applies all or nothing
            let missing = staged
                .keys()
                .find(|opid| state.send_by_opid(opid).is_none())
                .cloned();
            match missing {
                Some(opid) => Err(StoreError::Constraint(format!(
                    "withdrawal {} removed during execution",
                    opid
                ))),
                None => {
                    for (opid, updated) in staged {
                        if let Some(tx) = state.send_by_opid(&opid) {
                            *tx = updated;
                        }
                    }
                    Ok(())
                }
            }
        };
        self.close();
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.close();
        debug!("Execution transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryExecution {
    fn drop(&mut self) {
        if self.open {
            self.close();
        }
    }
}
