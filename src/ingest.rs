//! Ingestion path
//!
//! The one entry point through which chain observations reach the ledger,
//! whether they come from a live push or a rewind replay. A deposit seen twice
//! collides on its (txid, account) identity and is reported only once.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{CurrencyClient, DepositEvent, EntryCategory};
use crate::error::ConnectorError;
use crate::ledger::{Direction, LedgerStore, Transaction, TxKey, TxStatus};
use crate::sync::SyncEngine;

/// Maps a confirmation count to a ledger status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub required_confirmations: u32,
}

impl ConfirmationPolicy {
    pub fn new(required_confirmations: u32) -> Self {
        Self {
            required_confirmations,
        }
    }

    /// `None` means the currency is final after one block
    pub fn status_for(&self, confirmations: Option<u32>) -> TxStatus {
        match confirmations {
            None => TxStatus::Confirmed,
            Some(c) if c >= self.required_confirmations => TxStatus::Confirmed,
            Some(_) => TxStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Created,
    Advanced,
    Unchanged,
    Ignored,
}

pub struct Ingestor {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn CurrencyClient>,
    sync: Arc<SyncEngine>,
    policy: ConfirmationPolicy,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn CurrencyClient>,
        sync: Arc<SyncEngine>,
        policy: ConfirmationPolicy,
    ) -> Self {
        Self {
            store,
            chain,
            sync,
            policy,
        }
    }

    pub fn policy(&self) -> ConfirmationPolicy {
        self.policy
    }

    /// Record a deposit or advance the record it collides with
    pub async fn on_deposit(&self, event: &DepositEvent) -> Result<Ingested, ConnectorError> {
        if event.amount <= rust_decimal::Decimal::ZERO {
            warn!(txid = %event.txid, amount = %event.amount, "Ignoring non-positive deposit");
            return Ok(Ingested::Ignored);
        }
        if self.store.get_account(&event.account).await?.is_none() {
            debug!(txid = %event.txid, account = %event.account, "Deposit to foreign account ignored");
            return Ok(Ingested::Ignored);
        }

        let status = self.policy.status_for(event.confirmations);
        let key = TxKey::Receive {
            txid: event.txid.clone(),
            account: event.account.clone(),
        };

        if let Some(existing) = self.store.get(&key).await? {
            return self
                .advance_receive(existing, status, event.confirmations, Some(event.time))
                .await;
        }

        let tx = Transaction::receive(
            &event.txid,
            &event.account,
            event.amount,
            status,
            event.confirmations,
            event.time,
        );
        if !self.store.insert_receive(&tx).await? {
            // Inserted concurrently under the same identity
            return match self.store.get(&key).await? {
                Some(existing) => {
                    self.advance_receive(existing, status, event.confirmations, Some(event.time))
                        .await
                }
                None => Ok(Ingested::Unchanged),
            };
        }

        info!(
            txid = %event.txid,
            account = %event.account,
            amount = %event.amount,
            status = %status,
            "Deposit recorded"
        );
        self.sync.report_new_receive(&tx).await?;
        Ok(Ingested::Created)
    }

    async fn advance_receive(
        &self,
        mut tx: Transaction,
        status: TxStatus,
        confirmations: Option<u32>,
        time: Option<i64>,
    ) -> Result<Ingested, ConnectorError> {
        if !tx.observe(status, confirmations, time) {
            return Ok(Ingested::Unchanged);
        }
        self.store.update(&tx).await?;
        debug!(txid = ?tx.txid, account = %tx.account, status = %tx.status, "Receive advanced");
        self.sync.report_receive_update(&tx).await?;
        Ok(Ingested::Advanced)
    }

    /// Apply a confirmation update to every record carrying `txid`.
    ///
    /// Returns how many records changed.
    pub async fn on_transaction_update(
        &self,
        txid: &str,
        confirmations: Option<u32>,
        time: Option<i64>,
    ) -> Result<usize, ConnectorError> {
        let status = self.policy.status_for(confirmations);
        let mut changed = 0;

        for tx in self.store.find_by_txid(txid, Direction::Receive).await? {
            if self.advance_receive(tx, status, confirmations, time).await? == Ingested::Advanced {
                changed += 1;
            }
        }

        let mut sends_changed = false;
        for mut tx in self.store.find_by_txid(txid, Direction::Send).await? {
            if tx.observe(status, confirmations, time) {
                self.store.update(&tx).await?;
                sends_changed = true;
                changed += 1;
            }
        }
        if sends_changed {
            self.sync.report_send_update(txid).await?;
        }

        if changed > 0 {
            debug!(txid, changed, status = %status, "Transaction update applied");
        }
        Ok(changed)
    }

    /// Resolve a bare txid notification through the node
    pub async fn on_transaction_notify(&self, txid: &str) -> Result<usize, ConnectorError> {
        let info = self.chain.transaction_info(txid).await?;
        let mut touched = 0;

        for entry in info
            .entries
            .iter()
            .filter(|e| e.category == EntryCategory::Receive)
        {
            if self.on_deposit(&DepositEvent::from(entry)).await? != Ingested::Ignored {
                touched += 1;
            }
        }
        touched += self
            .on_transaction_update(txid, info.confirmations, Some(info.time))
            .await?;
        Ok(touched)
    }
}
