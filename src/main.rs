//! Ledger Connector - bitcoind connector process
//!
//! Wires one `Connector` to a bitcoind node and a configured ledger store:
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────┐
//! │ bitcoind │◀──▶│ Connector │───▶│  Ledger  │
//! │  (RPC)   │    │           │    │ (store)  │
//! └──────────┘    └─────┬─────┘    └──────────┘
//!                       │ outbox
//!                       ▼
//!                 main server
//! ```
//!
//! Until a main-server transport is attached every report is kept in the
//! outbox, and it is delivered by the reconcile pass once one comes up.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ledger_connector::chain::BitcoindClient;
use ledger_connector::main_server::{ReceiveUpdate, SendUpdate};
use ledger_connector::{
    AppConfig, Connector, ConnectorError, Fault, MainServer, Opid, RemoteError, Transaction,
    open_store,
};

const DEFAULT_CONFIG: &str = "config/connector.yaml";

/// Get config path from command line (--config argument)
fn get_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    DEFAULT_CONFIG.to_string()
}

/// Main-server side with no transport yet: every call reports a closed channel.
struct DetachedMainServer;

#[async_trait]
impl MainServer for DetachedMainServer {
    async fn new_transaction(&self, _tx: &Transaction) -> Result<Opid, RemoteError> {
        Err(RemoteError::Disconnected)
    }

    async fn update_received_tx(&self, _update: &ReceiveUpdate) -> Result<(), RemoteError> {
        Err(RemoteError::Disconnected)
    }

    async fn update_sent_tx(&self, _update: &SendUpdate) -> Result<(), RemoteError> {
        Err(RemoteError::Disconnected)
    }
}

#[tokio::main]
async fn main() {
    let config_path = get_config_path();
    let app_config = match AppConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", config_path, e);
            std::process::exit(2);
        }
    };
    let _log_guard = ledger_connector::logging::init_logging(&app_config.log);

    info!(
        config = %config_path,
        currency = %app_config.connector.currency,
        "Starting ledger connector"
    );

    if let Err(e) = run(app_config).await {
        error!(error = %e, "Connector terminated");
        std::process::exit(1);
    }
}

async fn run(app_config: AppConfig) -> Result<(), ConnectorError> {
    let rpc = app_config
        .btc_rpc
        .clone()
        .ok_or_else(|| ConnectorError::Config("btc_rpc section is required".to_string()))?;
    let store = open_store(&app_config.storage).await?;
    let chain = Arc::new(BitcoindClient::new(
        rpc,
        app_config.connector.required_confirmations,
    )?);

    let (connector, mut faults) = Connector::new(
        app_config.connector,
        store,
        chain,
        Arc::new(DetachedMainServer),
    );
    connector.set_main_server_online(false);

    // bitcoind has no push channel here; height changes come from the node poll
    let (events_tx, events) = mpsc::channel(1024);
    let mut engine = tokio::spawn(connector.clone().run(events));

    let outcome = loop {
        tokio::select! {
            fault = faults.recv() => match fault {
                Some(Fault::Fatal(msg)) => {
                    error!(%msg, "Local ledger may not match the chain, shutting down");
                    break Err(ConnectorError::Fatal(msg));
                }
                Some(Fault::Halted(e)) => {
                    warn!(error = %e, "Withdrawals halted until resumed by an operator");
                }
                None => break Ok(()),
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Signal handler failed");
                }
                info!("Shutdown requested");
                break Ok(());
            }
            result = &mut engine => {
                return match result {
                    Ok(result) => result,
                    Err(e) => Err(ConnectorError::Fatal(format!("connector task: {}", e))),
                };
            }
        }
    };

    drop(events_tx);
    match engine.await {
        Ok(Err(e)) => warn!(error = %e, "Connector stopped with error"),
        Err(e) => warn!(error = %e, "Connector task failed"),
        Ok(Ok(())) => info!("Connector stopped"),
    }
    outcome
}
