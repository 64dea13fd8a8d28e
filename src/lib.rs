//! Ledger Connector - per-currency connector core
//!
//! Sits between one blockchain node and a central main server. Records every
//! deposit and withdrawal in a local ledger, executes withdrawals on-chain in
//! single or batched mode, and keeps the main server's view in sync through
//! an outbox that survives disconnects.
//!
//! # Modules
//!
//! - [`ledger`] - Transaction records, status state machine, stores
//! - [`chain`] - Currency client capability trait and chain events
//! - [`main_server`] - Outbound channel to the main server
//! - [`api`] - Inbound request envelope and reply codes
//! - [`scheduler`] - Withdrawal queue (single / batch)
//! - [`executor`] - Withdrawal execution loop
//! - [`health`] - Node and main-server reachability signals
//! - [`sync`] - Main-server reporting and reconciliation
//! - [`ingest`] - Deposit and confirmation ingestion
//! - [`rewind`] - Recovery of history missed while offline
//! - [`connector`] - Composition and supervision

// Ambient
pub mod config;
pub mod error;
pub mod logging;

// Ledger and boundaries
pub mod api;
pub mod chain;
pub mod ledger;
pub mod main_server;

// Engine
pub mod connector;
pub mod executor;
pub mod health;
pub mod ingest;
pub mod rewind;
pub mod scheduler;
pub mod sync;


// Convenient re-exports at crate root
pub use api::{ApiResponse, InboundRequest, WithdrawRequest};
pub use chain::{ChainEvent, CurrencyClient, DepositEvent, HistoryMode};
pub use config::{AppConfig, ConnectorConfig, SchedulerConfig, StorageConfig};
pub use connector::Connector;
pub use error::{ChainError, ConnectorError, Fault, RemoteError, StoreError};
pub use ledger::{
    Account, Direction, LedgerStore, MemoryStore, Opid, PgStore, Transaction, TxStatus,
    open_store,
};
pub use main_server::MainServer;
