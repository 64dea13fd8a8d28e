//! Connector
//!
//! Composes the ledger, the currency client and the main-server channel into
//! one per-currency engine. The embedding process feeds it inbound requests,
//! chain events and main-server reachability; it reports back through typed
//! replies and the fault channel.
//!
//! Health edges drive the background loops:
//!
//! | edge | action |
//! |---|---|
//! | node online | start withdrawal loop, request rewind |
//! | node offline | stop withdrawal queue |
//! | main server online | reconcile |

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{
    AccountCreated, ApiResponse, InboundRequest, OperationAck, WithdrawRequest, error_codes,
};
use crate::chain::{ChainEvent, CurrencyClient};
use crate::config::{ConnectorConfig, SchedulerConfig};
use crate::error::{ConnectorError, Fault};
use crate::executor::{RunExit, WithdrawalExecutor};
use crate::health::{HealthEdge, HealthMonitor, Signal};
use crate::ingest::{ConfirmationPolicy, Ingestor};
use crate::ledger::{Account, CancelOutcome, LedgerStore, Opid, Transaction};
use crate::main_server::MainServer;
use crate::rewind::Rewinder;
use crate::scheduler::{QueueMode, WithdrawalQueue};
use crate::sync::SyncEngine;

pub struct Connector {
    config: ConnectorConfig,
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn CurrencyClient>,
    health: Arc<HealthMonitor>,
    sync: Arc<SyncEngine>,
    ingestor: Arc<Ingestor>,
    rewinder: Arc<Rewinder>,
    executor: Arc<WithdrawalExecutor>,
    edges: Mutex<Option<mpsc::UnboundedReceiver<HealthEdge>>>,
    last_height: AtomicU64,
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn CurrencyClient>,
        main: Arc<dyn MainServer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Fault>) {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (health, edges) = HealthMonitor::new();
        let health = Arc::new(health);

        let scheduler = match config.scheduler {
            SchedulerConfig::Batch { .. } if !chain.supports_send_many() => {
                warn!(
                    currency = chain.currency(),
                    "Client cannot send to many outputs, batch mode downgraded to single"
                );
                SchedulerConfig::Single
            }
            other => other,
        };

        let sync = Arc::new(SyncEngine::new(store.clone(), main));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            chain.clone(),
            sync.clone(),
            ConfirmationPolicy::new(config.required_confirmations),
        ));
        let rewinder = Arc::new(Rewinder::new(
            store.clone(),
            chain.clone(),
            ingestor.clone(),
        ));
        let executor = Arc::new(WithdrawalExecutor::new(
            store.clone(),
            chain.clone(),
            sync.clone(),
            health.clone(),
            WithdrawalQueue::new(QueueMode::from(scheduler)),
            faults_tx,
        ));

        info!(
            currency = chain.currency(),
            required_confirmations = config.required_confirmations,
            ?scheduler,
            "Connector created"
        );

        let connector = Arc::new(Self {
            config,
            store,
            chain,
            health,
            sync,
            ingestor,
            rewinder,
            executor,
            edges: Mutex::new(Some(edges)),
            last_height: AtomicU64::new(0),
        });
        (connector, faults_rx)
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn executor(&self) -> &Arc<WithdrawalExecutor> {
        &self.executor
    }

    // === Inbound requests ===

    /// Dispatch one inbound request into a typed reply
    pub async fn handle_request(&self, request: InboundRequest) -> ApiResponse {
        match request {
            InboundRequest::CreateAccount => {
                reply(self.create_account().await.map(|address| AccountCreated { address }))
            }
            InboundRequest::Withdraw(req) => {
                reply(self.withdraw(req).await.map(|opid| OperationAck { opid }))
            }
            InboundRequest::CancelWithdraw { opid } => reply(
                self.cancel_withdraw(&opid)
                    .await
                    .map(|()| OperationAck { opid }),
            ),
        }
    }

    /// Allocate a deposit address and register it
    pub async fn create_account(&self) -> Result<String, ConnectorError> {
        let address = self.chain.create_account().await?;
        if !self.store.insert_account(&Account::new(&address)).await? {
            warn!(address = %address, "Node returned an address already registered");
        }
        info!(address = %address, "Account created");
        Ok(address)
    }

    /// Accept a withdrawal request. It is persisted before it is queued.
    pub async fn withdraw(&self, req: WithdrawRequest) -> Result<Opid, ConnectorError> {
        if req.amount <= rust_decimal::Decimal::ZERO {
            return Err(ConnectorError::InvalidAmount);
        }
        if req.account.trim().is_empty() {
            return Err(ConnectorError::InvalidParameter(
                "destination account is empty".to_string(),
            ));
        }
        if req.opid.as_str().is_empty() {
            return Err(ConnectorError::InvalidParameter("opid is empty".to_string()));
        }

        let request = Transaction::withdrawal_request(req.opid.clone(), &req.account, req.amount);
        if !self.executor.submit(&request).await? {
            warn!(opid = %req.opid, "Duplicate withdrawal request");
            return Err(ConnectorError::DuplicateRequest(req.opid));
        }

        info!(
            opid = %req.opid,
            account = %req.account,
            amount = %req.amount,
            "Withdrawal requested"
        );
        Ok(req.opid)
    }

    /// Cancel a withdrawal that has not been executed yet
    pub async fn cancel_withdraw(&self, opid: &Opid) -> Result<(), ConnectorError> {
        match self.executor.cancel(opid).await? {
            CancelOutcome::Cancelled => {
                info!(opid = %opid, "Withdrawal cancelled");
                Ok(())
            }
            CancelOutcome::AlreadyExecuted => {
                warn!(opid = %opid, "Cancel refused, withdrawal already executed");
                Err(ConnectorError::AlreadyExecuted(opid.clone()))
            }
            CancelOutcome::NotFound => {
                debug!(opid = %opid, "Cancel for unknown withdrawal");
                Err(ConnectorError::UnknownOperation(opid.clone()))
            }
        }
    }

    // === Chain events ===

    pub async fn handle_chain_event(&self, event: ChainEvent) -> Result<(), ConnectorError> {
        match event {
            ChainEvent::Deposit(deposit) => {
                self.ingestor.on_deposit(&deposit).await?;
            }
            ChainEvent::TransactionNotify { txid } => {
                self.ingestor.on_transaction_notify(&txid).await?;
            }
            ChainEvent::TransactionUpdate {
                txid,
                confirmations,
                time,
            } => {
                self.ingestor
                    .on_transaction_update(&txid, confirmations, time)
                    .await?;
            }
            ChainEvent::NewBlock { height } => self.observe_height(height),
        }
        Ok(())
    }

    /// Request a rewind when the chain advanced past the last seen height
    fn observe_height(&self, height: u64) {
        let previous = self.last_height.fetch_max(height, Ordering::AcqRel);
        if previous != 0 && height > previous {
            debug!(height, previous, "Block height advanced");
            self.spawn_rewind();
        }
    }

    // === Health ===

    /// Called by the transport when the main-server channel opens or closes
    pub fn set_main_server_online(&self, online: bool) -> bool {
        self.health.set_main_server_online(online)
    }

    /// Ping the node once and update the node signal
    pub async fn poll_node(&self) -> bool {
        match self.chain.ping().await {
            Ok(status) => {
                self.health.set_node_online(true);
                self.observe_height(status.height);
                true
            }
            Err(e) => {
                if self.health.set_node_online(false) {
                    warn!(error = %e, "Node poll failed");
                }
                false
            }
        }
    }

    fn on_edge(&self, edge: HealthEdge) {
        match (edge.signal, edge.online) {
            (Signal::Node, true) => {
                self.spawn_withdrawal_loop();
                self.spawn_rewind();
            }
            (Signal::Node, false) => self.executor.stop(),
            (Signal::MainServer, true) => {
                self.spawn_reconcile();
            }
            (Signal::MainServer, false) => {
                debug!("Main server offline, reports go to outbox until reconnect")
            }
        }
    }

    fn spawn_withdrawal_loop(&self) -> JoinHandle<()> {
        let executor = self.executor.clone();
        let health = self.health.clone();
        let retry = self.config.node_poll_interval();
        tokio::spawn(async move {
            loop {
                match executor.run().await {
                    // The previous loop is still draining its last unit after a stop
                    Ok(RunExit::AlreadyRunning) => {
                        if !executor.queue().is_closed() {
                            return;
                        }
                        tokio::time::sleep(retry).await;
                        if !health.node_online() {
                            return;
                        }
                    }
                    Ok(RunExit::Halted) => {
                        warn!("Withdrawal loop halted, waiting for resume");
                        return;
                    }
                    Ok(exit) => {
                        debug!(?exit, "Withdrawal loop exited");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Withdrawal loop failed");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_rewind(&self) -> JoinHandle<()> {
        let rewinder = self.rewinder.clone();
        tokio::spawn(async move {
            if let Err(e) = rewinder.request().await {
                warn!(error = %e, "Rewind failed");
            }
        })
    }

    fn spawn_reconcile(&self) -> JoinHandle<()> {
        let sync = self.sync.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.reconcile().await {
                warn!(error = %e, "Reconcile failed");
            }
        })
    }

    /// Clear a withdrawal halt and restart the loop if the node is up
    pub fn resume_withdrawals(&self) {
        self.executor.resume();
        if self.health.node_online() {
            self.spawn_withdrawal_loop();
        }
    }

    /// Supervise until the chain event source closes.
    ///
    /// Polls the node on an interval, applies health edges and ingests chain
    /// events. Can only be called once.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChainEvent>,
    ) -> Result<(), ConnectorError> {
        let mut edges = self
            .edges
            .lock()
            .await
            .take()
            .ok_or_else(|| ConnectorError::Fatal("connector already running".to_string()))?;

        let poller = {
            let connector = self.clone();
            let interval = self.config.node_poll_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    connector.poll_node().await;
                }
            })
        };

        // Events apply in arrival order on their own task; edges never wait behind them
        let mut ingest = {
            let connector = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if let Err(e) = connector.handle_chain_event(event).await {
                        warn!(error = %e, "Chain event skipped");
                    }
                }
            })
        };

        info!(currency = self.chain.currency(), "Connector running");

        loop {
            tokio::select! {
                Some(edge) = edges.recv() => self.on_edge(edge),
                result = &mut ingest => {
                    if let Err(e) = result {
                        error!(error = %e, "Chain event task failed");
                    }
                    break;
                }
            }
        }

        poller.abort();
        self.executor.stop();
        info!("Chain event source closed, connector stopped");
        Ok(())
    }
}

fn reply<T: Serialize>(result: Result<T, ConnectorError>) -> ApiResponse {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(value) => ApiResponse::success(value),
            Err(e) => ApiResponse::error(error_codes::INTERNAL_ERROR, e.to_string()),
        },
        Err(e) => ApiResponse::from(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HistoryMode;
    use crate::chain::mock::MockChain;
    use crate::ledger::{MemoryStore, TxKey, TxStatus};
    use crate::main_server::mock::MockMainServer;
    use rust_decimal::Decimal;

    fn connector(
        chain: MockChain,
        scheduler: SchedulerConfig,
    ) -> (Arc<Connector>, Arc<MemoryStore>, Arc<MockChain>) {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(chain);
        let mut config = ConnectorConfig::new("MOCK", 1);
        config.scheduler = scheduler;
        let (connector, _faults) = Connector::new(
            config,
            store.clone(),
            chain.clone(),
            Arc::new(MockMainServer::new()),
        );
        (connector, store, chain)
    }

    fn withdraw(opid: &str, amount: i64) -> InboundRequest {
        InboundRequest::Withdraw(WithdrawRequest {
            opid: Opid::from(opid),
            account: "dest".into(),
            amount: Decimal::new(amount, 0),
        })
    }

    #[tokio::test]
    async fn test_batch_downgraded_without_send_many() {
        let (connector, _, _) = connector(
            MockChain::new(HistoryMode::SinceBlock).without_send_many(),
            SchedulerConfig::Batch {
                min_transactions: 2,
                max_wait_ms: 1000,
            },
        );
        assert_eq!(connector.executor().queue().mode(), QueueMode::Single);
    }

    #[tokio::test]
    async fn test_create_account_registers_address() {
        let (connector, store, _) = connector(
            MockChain::new(HistoryMode::SinceBlock),
            SchedulerConfig::Single,
        );

        let resp = connector.handle_request(InboundRequest::CreateAccount).await;

        assert!(resp.is_success());
        let address = resp.data.unwrap()["address"].as_str().unwrap().to_string();
        assert!(store.get_account(&address).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_withdraw_validation_and_duplicates() {
        let (connector, store, _) = connector(
            MockChain::new(HistoryMode::SinceBlock),
            SchedulerConfig::Single,
        );

        assert_eq!(
            connector.handle_request(withdraw("w0", 0)).await.code,
            error_codes::INVALID_PARAMETER
        );

        let ok = connector.handle_request(withdraw("w1", 5)).await;
        assert!(ok.is_success());
        assert_eq!(ok.data.unwrap()["opid"], "w1");

        assert_eq!(
            connector.handle_request(withdraw("w1", 5)).await.code,
            error_codes::DUPLICATE_REQUEST
        );

        let stored = store
            .get(&TxKey::Send {
                opid: Opid::from("w1"),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TxStatus::Requested);
    }

    #[tokio::test]
    async fn test_cancel_replies() {
        let (connector, _, _) = connector(
            MockChain::new(HistoryMode::SinceBlock),
            SchedulerConfig::Single,
        );
        connector.handle_request(withdraw("w1", 5)).await;

        let cancel = |opid: &str| InboundRequest::CancelWithdraw {
            opid: Opid::from(opid),
        };
        assert!(connector.handle_request(cancel("w1")).await.is_success());
        assert_eq!(
            connector.handle_request(cancel("w1")).await.code,
            error_codes::OPERATION_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_cancelled_opid_resubmitted_into_open_batch() {
        let (connector, store, _) = connector(
            MockChain::new(HistoryMode::SinceBlock),
            SchedulerConfig::Batch {
                min_transactions: 3,
                max_wait_ms: 60_000,
            },
        );
        assert!(connector.handle_request(withdraw("w1", 5)).await.is_success());
        assert!(
            connector
                .handle_request(InboundRequest::CancelWithdraw {
                    opid: Opid::from("w1"),
                })
                .await
                .is_success()
        );

        let again = connector.handle_request(withdraw("w1", 7)).await;

        assert!(again.is_success());
        let stored = store
            .get(&TxKey::Send {
                opid: Opid::from("w1"),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.amount, Decimal::new(7, 0));
    }

    #[tokio::test]
    async fn test_poll_tracks_node_state() {
        let (connector, _, chain) = connector(
            MockChain::new(HistoryMode::SinceBlock),
            SchedulerConfig::Single,
        );

        assert!(connector.poll_node().await);
        assert!(connector.health().node_online());

        chain.set_online(false);
        assert!(!connector.poll_node().await);
        assert!(!connector.health().node_online());
    }

    #[tokio::test]
    async fn test_run_rejects_second_call() {
        let (connector, _, _) = connector(
            MockChain::new(HistoryMode::SinceBlock),
            SchedulerConfig::Single,
        );
        let (_events_tx, events) = mpsc::channel(8);
        let first = tokio::spawn(connector.clone().run(events));
        tokio::task::yield_now().await;

        let (_tx2, events2) = mpsc::channel(8);
        assert!(matches!(
            connector.clone().run(events2).await,
            Err(ConnectorError::Fatal(_))
        ));
        first.abort();
    }
}
