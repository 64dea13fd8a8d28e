//! Synchronization Engine
//!
//! Delivers local transaction events to the main server at least once and
//! folds its typed answers back into the ledger. Reports are serialized
//! through one delivery lock, so no two reports for the same record are ever
//! in flight together and a record's reports go out in mutation order.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, StoreError};
use crate::ledger::{Direction, LedgerStore, PendingDelivery, Transaction, TxStatus, needs_sync};
use crate::main_server::{MainServer, ReceiveUpdate, SendUpdate};

/// What a single report did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Main server accepted the report
    Acknowledged,
    /// Accepted and the record is now `completed`
    Completed,
    /// Channel down; kept for the next reconcile pass
    Deferred,
    /// Main server already had the operation; its opid was adopted
    Adopted,
    /// Account unknown remotely; removed locally with its records
    Purged,
    /// Main server had nothing left to update
    Resolved,
    /// Stale send removed locally
    Deleted,
    /// Rejected for another reason; logged and skipped
    Skipped,
    /// Record vanished before it could be reported
    Missing,
    /// Main server already holds the record's latest state
    Current,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub acknowledged: usize,
    pub completed: usize,
    pub deferred: usize,
    pub removed: usize,
    pub failed: usize,
    pub orphans_dropped: usize,
    /// Stopped early because the channel went down again
    pub interrupted: bool,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Acknowledged | SyncOutcome::Adopted | SyncOutcome::Resolved => {
                self.acknowledged += 1
            }
            SyncOutcome::Completed => self.completed += 1,
            SyncOutcome::Deferred => self.deferred += 1,
            SyncOutcome::Purged | SyncOutcome::Deleted => self.removed += 1,
            SyncOutcome::Skipped => self.failed += 1,
            SyncOutcome::Missing | SyncOutcome::Current => {}
        }
    }
}

pub struct SyncEngine {
    store: Arc<dyn LedgerStore>,
    main: Arc<dyn MainServer>,
    delivery: Mutex<()>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn LedgerStore>, main: Arc<dyn MainServer>) -> Self {
        Self {
            store,
            main,
            delivery: Mutex::new(()),
        }
    }

    /// Report a receive the main server has not acknowledged yet.
    ///
    /// `tx` only names the record; what is reported is the stored state
    /// read under the delivery lock.
    pub async fn report_new_receive(&self, tx: &Transaction) -> Result<SyncOutcome, StoreError> {
        let _delivery = self.delivery.lock().await;
        let Some(current) = self.reload(tx).await? else {
            return Ok(SyncOutcome::Missing);
        };
        if current.completed || current.opid.is_some() {
            debug!(key = %current.key()?, "Receive already acknowledged");
            return Ok(SyncOutcome::Current);
        }
        self.new_receive(&current).await
    }

    /// Report confirmation progress of a receive.
    ///
    /// A record without an opid was never acknowledged and is reported as new.
    pub async fn report_receive_update(
        &self,
        tx: &Transaction,
    ) -> Result<SyncOutcome, StoreError> {
        let _delivery = self.delivery.lock().await;
        let Some(current) = self.reload(tx).await? else {
            return Ok(SyncOutcome::Missing);
        };
        if current.completed {
            return Ok(SyncOutcome::Current);
        }
        self.receive_update(&current).await
    }

    async fn reload(&self, tx: &Transaction) -> Result<Option<Transaction>, StoreError> {
        let key = tx.key()?;
        let current = self.store.get(&key).await?;
        if current.is_none() {
            debug!(%key, "Record gone before report");
        }
        Ok(current)
    }

    /// Report every send carrying `txid`
    pub async fn report_send_update(&self, txid: &str) -> Result<Vec<SyncOutcome>, StoreError> {
        let _delivery = self.delivery.lock().await;
        self.send_update(txid).await
    }

    /// Re-report everything not yet completed, then drop outbox entries whose
    /// record no longer exists.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, StoreError> {
        let _delivery = self.delivery.lock().await;
        let mut summary = ReconcileSummary::default();
        let mut seen_txids = HashSet::new();
        let mut purged = HashSet::new();

        let unsynced = self.store.unsynced().await?;
        info!(count = unsynced.len(), "Reconcile started");

        for tx in unsynced {
            if purged.contains(&tx.account) {
                continue;
            }
            summary.examined += 1;

            let result = match tx.direction {
                Direction::Receive => self.receive_update(&tx).await.map(|o| vec![o]),
                Direction::Send => match &tx.txid {
                    Some(txid) if seen_txids.insert(txid.clone()) => self.send_update(txid).await,
                    _ => continue,
                },
            };

            match result {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        summary.record(outcome);
                        if outcome == SyncOutcome::Purged {
                            purged.insert(tx.account.clone());
                        }
                    }
                    if summary.deferred > 0 {
                        summary.interrupted = true;
                        warn!("Main server channel lost during reconcile");
                        break;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(account = %tx.account, txid = ?tx.txid, error = %e, "Reconcile skipped record");
                }
            }
        }

        if !summary.interrupted {
            for entry in self.store.list_pending().await? {
                let key = entry.key();
                if self.store.get(&key).await?.is_none_or(|tx| tx.completed) {
                    self.store.delete_pending(&key).await?;
                    summary.orphans_dropped += 1;
                }
            }
        }

        info!(?summary, "Reconcile finished");
        Ok(summary)
    }

    async fn new_receive(&self, tx: &Transaction) -> Result<SyncOutcome, StoreError> {
        let key = tx.key()?;

        match self.main.new_transaction(tx).await {
            Ok(opid) => {
                self.store.set_opid(&key, &opid).await?;
                self.store.delete_pending(&key).await?;
                info!(opid = %opid, %key, "Receive acknowledged");
                if tx.status == TxStatus::Confirmed && self.store.mark_completed(&key).await? {
                    return Ok(SyncOutcome::Completed);
                }
                Ok(SyncOutcome::Acknowledged)
            }
            Err(RemoteError::Disconnected) => {
                self.store
                    .put_pending(&PendingDelivery::new(tx.clone())?)
                    .await?;
                warn!(%key, "Main server disconnected, receive kept in outbox");
                Ok(SyncOutcome::Deferred)
            }
            Err(RemoteError::UnknownAccount(_)) => {
                let report = self.store.purge_account(&tx.account).await?;
                warn!(
                    account = %tx.account,
                    transactions = report.transactions,
                    pending = report.pending,
                    "Main server does not know account, purged locally"
                );
                Ok(SyncOutcome::Purged)
            }
            Err(RemoteError::DuplicateOperation { opid }) => {
                self.store.set_opid(&key, &opid).await?;
                self.store.delete_pending(&key).await?;
                info!(opid = %opid, %key, "Main server already has receive, adopted opid");

                if tx.status == TxStatus::Confirmed {
                    let mut adopted = tx.clone();
                    adopted.opid = Some(opid);
                    self.acknowledge_receive(&adopted).await?;
                }
                Ok(SyncOutcome::Adopted)
            }
            Err(e) => {
                warn!(%key, error = %e, "Receive report rejected");
                Ok(SyncOutcome::Skipped)
            }
        }
    }

    async fn receive_update(&self, tx: &Transaction) -> Result<SyncOutcome, StoreError> {
        if tx.opid.is_none() {
            return self.new_receive(tx).await;
        }
        self.acknowledge_receive(tx).await
    }

    async fn acknowledge_receive(&self, tx: &Transaction) -> Result<SyncOutcome, StoreError> {
        let key = tx.key()?;
        let (Some(opid), Some(txid)) = (&tx.opid, &tx.txid) else {
            return Ok(SyncOutcome::Missing);
        };
        let update = ReceiveUpdate {
            opid: opid.clone(),
            txid: txid.clone(),
            account: tx.account.clone(),
            status: tx.status,
            confirmations: tx.confirmations,
        };

        match self.main.update_received_tx(&update).await {
            Ok(()) => {
                debug!(opid = %opid, status = %tx.status, "Receive update acknowledged");
                if tx.status == TxStatus::Confirmed && self.store.mark_completed(&key).await? {
                    return Ok(SyncOutcome::Completed);
                }
                Ok(SyncOutcome::Acknowledged)
            }
            Err(RemoteError::Disconnected) => {
                debug!(opid = %opid, "Main server disconnected, receive update left for reconcile");
                Ok(SyncOutcome::Deferred)
            }
            Err(RemoteError::OperationNotFound) => {
                info!(opid = %opid, "Main server has no open operation, treated as resolved");
                if tx.status == TxStatus::Confirmed {
                    self.store.mark_completed(&key).await?;
                }
                Ok(SyncOutcome::Resolved)
            }
            Err(e) => {
                warn!(opid = %opid, error = %e, "Receive update rejected");
                Ok(SyncOutcome::Skipped)
            }
        }
    }

    async fn send_update(&self, txid: &str) -> Result<Vec<SyncOutcome>, StoreError> {
        let records = self.store.find_by_txid(txid, Direction::Send).await?;
        let mut outcomes = Vec::with_capacity(records.len());

        for tx in records.iter().filter(|tx| needs_sync(tx)) {
            let key = tx.key()?;
            let (Some(opid), Some(timestamp)) = (&tx.opid, tx.timestamp) else {
                outcomes.push(SyncOutcome::Missing);
                continue;
            };
            let update = SendUpdate {
                opid: opid.clone(),
                txid: txid.to_string(),
                status: tx.status,
                confirmations: tx.confirmations,
                timestamp,
            };

            let outcome = match self.main.update_sent_tx(&update).await {
                Ok(()) => {
                    debug!(opid = %opid, txid, status = %tx.status, "Send update acknowledged");
                    if tx.status == TxStatus::Confirmed && self.store.mark_completed(&key).await? {
                        SyncOutcome::Completed
                    } else {
                        SyncOutcome::Acknowledged
                    }
                }
                Err(RemoteError::Disconnected) => {
                    debug!(opid = %opid, "Main server disconnected, send update left for reconcile");
                    outcomes.push(SyncOutcome::Deferred);
                    break;
                }
                Err(RemoteError::OperationNotFound) => {
                    self.store.delete(&key).await?;
                    warn!(opid = %opid, txid, "Main server has no such withdrawal, local record deleted");
                    SyncOutcome::Deleted
                }
                Err(e) => {
                    warn!(opid = %opid, error = %e, "Send update rejected");
                    SyncOutcome::Skipped
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}
