//! Withdrawal Executor
//!
//! Drains the withdrawal queue. Each unit is handled inside one store-level
//! execution transaction:
//!
//! ```text
//! claim (re-verify `requested`) → send → record txid on every member → commit → report
//! ```
//!
//! A cancel that reaches the store before the claim wins; one that arrives
//! later waits for the commit and sees `AlreadyExecuted`.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::chain::{CurrencyClient, SendReceipt};
use crate::error::{ChainError, ConnectorError, Fault, StoreError};
use crate::health::HealthMonitor;
use crate::ledger::{CancelOutcome, LedgerStore, Opid, Transaction};
use crate::rewind::RunGuard;
use crate::scheduler::{Pulled, Unit, WithdrawalQueue};
use crate::sync::SyncEngine;

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Another loop instance is active
    AlreadyRunning,
    /// Queue closed (node went offline or shutdown)
    Stopped,
    /// A send was refused by the node; waits for `resume`
    Halted,
    /// Node unreachable mid-unit; restarts on the next online edge
    Interrupted,
}

pub struct WithdrawalExecutor {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn CurrencyClient>,
    sync: Arc<SyncEngine>,
    health: Arc<HealthMonitor>,
    queue: WithdrawalQueue,
    /// Serializes request intake against queue bootstrap
    intake: Mutex<()>,
    running: AtomicBool,
    halted: AtomicBool,
    faults: mpsc::UnboundedSender<Fault>,
}

impl WithdrawalExecutor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn CurrencyClient>,
        sync: Arc<SyncEngine>,
        health: Arc<HealthMonitor>,
        queue: WithdrawalQueue,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Self {
        Self {
            store,
            chain,
            sync,
            health,
            queue,
            intake: Mutex::new(()),
            running: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            faults,
        }
    }

    pub fn queue(&self) -> &WithdrawalQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Clear a halt; the loop starts again on the next node-online edge
    pub fn resume(&self) {
        if self.halted.swap(false, Ordering::AcqRel) {
            info!("Withdrawal execution resumed");
        }
    }

    /// Persist a withdrawal request, then queue it.
    ///
    /// Returns false if the opid is already known.
    pub async fn submit(&self, request: &Transaction) -> Result<bool, StoreError> {
        let _intake = self.intake.lock().await;
        if !self.store.insert_request(request).await? {
            return Ok(false);
        }
        if let Some(opid) = &request.opid {
            self.queue.push(opid.clone());
        }
        Ok(true)
    }

    /// Cancel a requested withdrawal and drop it from the queue.
    pub async fn cancel(&self, opid: &Opid) -> Result<CancelOutcome, StoreError> {
        let _intake = self.intake.lock().await;
        let outcome = self.store.cancel_request(opid).await?;
        if outcome == CancelOutcome::Cancelled {
            self.queue.discard(opid);
        }
        Ok(outcome)
    }

    pub fn stop(&self) {
        self.queue.stop();
    }

    /// Consumer loop. Only one instance runs at a time.
    pub async fn run(&self) -> Result<RunExit, ConnectorError> {
        let Some(_running) = RunGuard::acquire(&self.running) else {
            debug!("Withdrawal loop already running");
            return Ok(RunExit::AlreadyRunning);
        };
        if self.is_halted() {
            warn!("Withdrawal execution halted, not starting");
            return Ok(RunExit::Halted);
        }

        {
            let _intake = self.intake.lock().await;
            let pending = self.store.requested_sends().await?;
            self.queue.activate(pending);
        }
        info!(currency = self.chain.currency(), "Withdrawal loop started");

        loop {
            let unit = match self.queue.pull().await {
                Pulled::Unit(unit) => unit,
                Pulled::Closed => {
                    info!("Withdrawal loop stopped");
                    return Ok(RunExit::Stopped);
                }
            };

            match self.execute_unit(&unit).await {
                Ok(sent) => debug!(members = unit.len(), sent, "Unit done"),
                Err(ConnectorError::Chain(ChainError::DefinitelyNotSent(reason))) => {
                    error!(%reason, ?unit, "Node refused withdrawal, execution halted");
                    self.halted.store(true, Ordering::Release);
                    self.queue.stop();
                    self.raise(Fault::Halted(ChainError::DefinitelyNotSent(reason)));
                    return Ok(RunExit::Halted);
                }
                Err(ConnectorError::Chain(e)) if e.is_retryable() => {
                    warn!(error = %e, ?unit, "Node unreachable, unit re-queued for next start");
                    self.queue.stop();
                    self.health.set_node_online(false);
                    return Ok(RunExit::Interrupted);
                }
                Err(e) => {
                    let msg = format!("withdrawal unit {:?}: {}", unit, e);
                    error!(error = %e, ?unit, "Withdrawal execution failed in unknown state");
                    self.queue.stop();
                    self.raise(Fault::Fatal(msg.clone()));
                    return Err(ConnectorError::Fatal(msg));
                }
            }
        }
    }

    /// Hand a fault to the supervisor. A dropped receiver still leaves a log line.
    fn raise(&self, fault: Fault) {
        if let Err(mpsc::error::SendError(fault)) = self.faults.send(fault) {
            error!(?fault, "Fault channel closed, supervisor not notified");
        }
    }

    /// Execute one unit. Returns how many members were sent.
    async fn execute_unit(&self, unit: &Unit) -> Result<usize, ConnectorError> {
        let opids: Vec<_> = unit.iter().cloned().collect();
        let mut exec = self.store.begin_execution().await?;

        let claimed = exec.claim_requested(&opids).await?;
        if claimed.len() < opids.len() {
            info!(
                dropped = opids.len() - claimed.len(),
                "Cancelled withdrawals removed from unit"
            );
        }
        if claimed.is_empty() {
            exec.commit().await?;
            return Ok(0);
        }

        let receipt = match self.send(&claimed).await {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Err(rb) = exec.rollback().await {
                    warn!(error = %rb, "Rollback after failed send");
                }
                return Err(e.into());
            }
        };

        // Broadcast succeeded: any failure from here on leaves the ledger behind the chain
        let persisted: Result<(), StoreError> = async {
            for tx in &claimed {
                if let Some(opid) = &tx.opid {
                    exec.record_sent(opid, &receipt).await?;
                }
            }
            exec.commit().await
        }
        .await;
        if let Err(e) = persisted {
            return Err(ConnectorError::Fatal(format!(
                "txid {} broadcast but not recorded: {}",
                receipt.txid, e
            )));
        }

        info!(
            txid = %receipt.txid,
            members = claimed.len(),
            status = %receipt.status,
            "Withdrawal executed"
        );

        if let Err(e) = self.sync.report_send_update(&receipt.txid).await {
            warn!(txid = %receipt.txid, error = %e, "Send report failed, left for reconcile");
        }
        Ok(claimed.len())
    }

    async fn send(&self, claimed: &[Transaction]) -> Result<SendReceipt, ChainError> {
        if let [only] = claimed {
            return self.chain.send_one(&only.account, only.amount).await;
        }

        let mut outputs: BTreeMap<String, Decimal> = BTreeMap::new();
        for tx in claimed {
            *outputs.entry(tx.account.clone()).or_insert(Decimal::ZERO) += tx.amount;
        }
        self.chain.send_many(&outputs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HistoryMode;
    use crate::chain::mock::MockChain;
    use crate::ledger::{MemoryStore, Opid, TxKey, TxStatus};
    use crate::main_server::mock::MockMainServer;
    use crate::scheduler::QueueMode;
    use std::collections::BTreeSet;

    struct Fixture {
        store: Arc<MemoryStore>,
        chain: Arc<MockChain>,
        main: Arc<MockMainServer>,
        executor: WithdrawalExecutor,
        faults: mpsc::UnboundedReceiver<Fault>,
    }

    fn fixture(mode: QueueMode) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new(HistoryMode::SinceBlock));
        let main = Arc::new(MockMainServer::new());
        let sync = Arc::new(SyncEngine::new(store.clone(), main.clone()));
        let (health, _edges) = HealthMonitor::new();
        let (tx, faults) = mpsc::unbounded_channel();
        let executor = WithdrawalExecutor::new(
            store.clone(),
            chain.clone(),
            sync,
            Arc::new(health),
            WithdrawalQueue::new(mode),
            tx,
        );
        Fixture {
            store,
            chain,
            main,
            executor,
            faults,
        }
    }

    fn request(opid: &str, account: &str, amount: i64) -> Transaction {
        Transaction::withdrawal_request(Opid::from(opid), account, Decimal::new(amount, 0))
    }

    fn unit(ids: &[&str]) -> Unit {
        ids.iter().map(|s| Opid::from(*s)).collect::<BTreeSet<_>>()
    }

    async fn status(store: &MemoryStore, opid: &str) -> Option<TxStatus> {
        store
            .get(&TxKey::Send {
                opid: Opid::from(opid),
            })
            .await
            .unwrap()
            .map(|tx| tx.status)
    }

    #[tokio::test]
    async fn test_single_member_uses_send_one() {
        let f = fixture(QueueMode::Single);
        f.store.insert_request(&request("w1", "dest", 3)).await.unwrap();

        assert_eq!(f.executor.execute_unit(&unit(&["w1"])).await.unwrap(), 1);

        assert_eq!(f.chain.send_one_count(), 1);
        assert_eq!(status(&f.store, "w1").await, Some(TxStatus::Pending));
        assert_eq!(f.main.send_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_sums_per_destination() {
        let f = fixture(QueueMode::Single);
        f.store.insert_request(&request("w1", "dest", 10)).await.unwrap();
        f.store.insert_request(&request("w2", "dest", 11)).await.unwrap();
        f.store.insert_request(&request("w3", "other", 1)).await.unwrap();

        f.executor
            .execute_unit(&unit(&["w1", "w2", "w3"]))
            .await
            .unwrap();

        assert_eq!(f.chain.send_many_count(), 1);
        let sends = f.chain.sends();
        assert_eq!(sends[0].get("dest"), Some(&Decimal::new(21, 0)));
        assert_eq!(sends[0].get("other"), Some(&Decimal::new(1, 0)));
    }

    #[tokio::test]
    async fn test_cancelled_members_are_dropped() {
        let f = fixture(QueueMode::Single);
        f.store.insert_request(&request("w1", "dest", 10)).await.unwrap();
        f.store.cancel_request(&Opid::from("w1")).await.unwrap();

        assert_eq!(f.executor.execute_unit(&unit(&["w1"])).await.unwrap(), 0);
        assert_eq!(f.chain.send_one_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back() {
        let f = fixture(QueueMode::Single);
        f.store.insert_request(&request("w1", "dest", 10)).await.unwrap();
        f.chain
            .set_fail_send(Some(ChainError::NodeUnreachable("down".into())));

        assert!(f.executor.execute_unit(&unit(&["w1"])).await.is_err());
        assert_eq!(status(&f.store, "w1").await, Some(TxStatus::Requested));
    }

    #[tokio::test]
    async fn test_refused_send_halts_loop() {
        let mut f = fixture(QueueMode::Single);
        f.chain
            .set_fail_send(Some(ChainError::DefinitelyNotSent("insufficient funds".into())));
        f.executor.submit(&request("w1", "dest", 10)).await.unwrap();

        assert_eq!(f.executor.run().await.unwrap(), RunExit::Halted);

        assert!(f.executor.is_halted());
        assert!(matches!(f.faults.recv().await, Some(Fault::Halted(_))));
        assert_eq!(status(&f.store, "w1").await, Some(TxStatus::Requested));
        assert_eq!(f.executor.run().await.unwrap(), RunExit::Halted);

        f.executor.resume();
        assert!(!f.executor.is_halted());
    }

    #[tokio::test]
    async fn test_bootstrap_picks_up_requests_accepted_while_stopped() {
        let f = fixture(QueueMode::Single);
        let executor = Arc::new(f.executor);
        executor.stop();
        executor.submit(&request("w1", "dest", 4)).await.unwrap();

        let runner = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run().await })
        };
        while f.chain.send_one_count() == 0 {
            tokio::task::yield_now().await;
        }
        executor.stop();

        assert_eq!(runner.await.unwrap().unwrap(), RunExit::Stopped);
        assert_eq!(status(&f.store, "w1").await, Some(TxStatus::Pending));
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let f = fixture(QueueMode::Single);
        assert!(f.executor.submit(&request("w1", "dest", 4)).await.unwrap());
        assert!(!f.executor.submit(&request("w1", "dest", 4)).await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_send_halts_without_supervisor() {
        let Fixture {
            store,
            chain,
            executor,
            faults,
            ..
        } = fixture(QueueMode::Single);
        drop(faults);
        chain.set_fail_send(Some(ChainError::DefinitelyNotSent("insufficient funds".into())));
        executor.submit(&request("w1", "dest", 10)).await.unwrap();

        assert_eq!(executor.run().await.unwrap(), RunExit::Halted);
        assert!(executor.is_halted());
        assert_eq!(status(&store, "w1").await, Some(TxStatus::Requested));
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_member() {
        let f = fixture(QueueMode::Batch {
            min_transactions: 2,
            max_wait: std::time::Duration::from_secs(60),
        });
        f.executor.submit(&request("w1", "dest", 10)).await.unwrap();

        assert_eq!(
            f.executor.cancel(&Opid::from("w1")).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert!(!f.executor.queue().discard(&Opid::from("w1")));
        assert_eq!(status(&f.store, "w1").await, None);

        assert!(f.executor.submit(&request("w1", "dest", 12)).await.unwrap());
        assert_eq!(
            f.executor.cancel(&Opid::from("w9")).await.unwrap(),
            CancelOutcome::NotFound
        );
    }
}
