//! Transaction Ledger
//!
//! Local record of every value-moving event, the outbox of unacknowledged
//! receives, and per-account history markers.
//!
//! - [`types`] - record shapes and the status state machine
//! - [`store`] - persistence contract (`LedgerStore`, `ExecutionTx`)
//! - [`memory`] - in-process store
//! - [`pg`] - PostgreSQL store

pub mod memory;
pub mod pg;
pub mod store;
pub mod types;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{CancelOutcome, ExecutionTx, LedgerStore, PurgeReport, needs_sync};
pub use types::{Account, Direction, Opid, PendingDelivery, Transaction, TxKey, TxStatus};

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::StoreError;

/// Open the configured backend. Postgres schemas are created if missing.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>, StoreError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::Postgres {
            url,
            max_connections,
        } => {
            let store = PgStore::connect(url, *max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&StorageConfig::Memory).await.unwrap();
        assert!(store.insert_account(&Account::new("a1")).await.unwrap());
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }
}
