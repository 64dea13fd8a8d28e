//! Rewind / history reconciliation
//!
//! Recovers deposits missed while the connector was not watching the chain
//! and replays them through the regular ingestion path, so the ledger's
//! identity rules make a second sighting a no-op.
//!
//! Two walks, chosen by the client's [`HistoryMode`]:
//! - `AccountChain`: per account, follow `previous` links back from the
//!   frontier to the stored marker, collect confirmed receives, replay oldest first.
//! - `SinceBlock`: one wallet-wide listing since the module marker.
//!
//! Only one pass runs at a time. A request arriving mid-pass is folded into
//! a single follow-up pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::chain::{CurrencyClient, DepositEvent, EntryCategory, HistoryMode};
use crate::error::ConnectorError;
use crate::ingest::{Ingested, Ingestor};
use crate::ledger::{Account, LedgerStore};

/// Holds a "loop already running" flag for its lifetime
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewindReport {
    pub passes: usize,
    pub accounts: usize,
    pub replayed: usize,
    pub created: usize,
}

impl RewindReport {
    fn merge(&mut self, other: RewindReport) {
        self.passes += other.passes;
        self.accounts += other.accounts;
        self.replayed += other.replayed;
        self.created += other.created;
    }
}

pub struct Rewinder {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn CurrencyClient>,
    ingestor: Arc<Ingestor>,
    running: AtomicBool,
    rerun: AtomicBool,
}

impl Rewinder {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn CurrencyClient>,
        ingestor: Arc<Ingestor>,
    ) -> Self {
        Self {
            store,
            chain,
            ingestor,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a pass, or fold into the one already running.
    ///
    /// Returns `None` when the request was coalesced.
    pub async fn request(&self) -> Result<Option<RewindReport>, ConnectorError> {
        let mut total = RewindReport::default();

        loop {
            let Some(_running) = RunGuard::acquire(&self.running) else {
                self.rerun.store(true, Ordering::Release);
                if total.passes == 0 {
                    debug!("Rewind in progress, request coalesced");
                    return Ok(None);
                }
                return Ok(Some(total));
            };

            loop {
                self.rerun.store(false, Ordering::Release);
                total.merge(self.pass().await?);
                if !self.rerun.load(Ordering::Acquire) {
                    break;
                }
            }

            drop(_running);
            // A request may have landed between the last check and the release
            if !self.rerun.load(Ordering::Acquire) {
                return Ok(Some(total));
            }
        }
    }

    async fn pass(&self) -> Result<RewindReport, ConnectorError> {
        let mut report = match self.chain.history_mode() {
            HistoryMode::AccountChain => self.rewind_accounts().await?,
            HistoryMode::SinceBlock => self.rewind_since_block().await?,
        };
        report.passes = 1;
        info!(
            accounts = report.accounts,
            replayed = report.replayed,
            created = report.created,
            "Rewind pass finished"
        );
        Ok(report)
    }

    async fn rewind_accounts(&self) -> Result<RewindReport, ConnectorError> {
        let mut report = RewindReport::default();

        for account in self.store.list_accounts().await? {
            match self.rewind_account(&account).await {
                Ok(r) => report.merge(r),
                Err(ConnectorError::Chain(e)) if e.is_retryable() => {
                    return Err(ConnectorError::Chain(e));
                }
                Err(e) => {
                    warn!(account = %account.address, error = %e, "Rewind skipped account");
                }
            }
        }
        Ok(report)
    }

    /// Walk one account chain back to its marker and replay what was missed
    pub async fn rewind_account(&self, account: &Account) -> Result<RewindReport, ConnectorError> {
        let mut report = RewindReport {
            accounts: 1,
            ..RewindReport::default()
        };
        let Some(frontier) = self.chain.account_frontier(&account.address).await? else {
            return Ok(report);
        };
        let marker = account.last_block.as_deref();
        if marker == Some(frontier.as_str()) {
            return Ok(report);
        }

        let mut recovered = Vec::new();
        // Newest block below which everything is settled
        let mut new_marker = Some(frontier.clone());
        let mut cursor = Some(frontier);

        while let Some(hash) = cursor {
            if marker == Some(hash.as_str()) {
                break;
            }
            let block = self.chain.block_info(&hash).await?;
            if !block.confirmed {
                new_marker = block.previous.clone();
            } else if block.is_confirmed_receive_into(&account.address) {
                recovered.push(DepositEvent::from(&block));
            }
            cursor = block.previous;
        }

        recovered.reverse();
        for event in &recovered {
            report.replayed += 1;
            if self.ingestor.on_deposit(event).await? == Ingested::Created {
                report.created += 1;
            }
        }

        if let Some(marker) = new_marker {
            self.store.set_last_block(&account.address, &marker).await?;
            debug!(account = %account.address, marker = %marker, "Account marker advanced");
        }
        Ok(report)
    }

    /// List wallet history since the module marker and replay it
    pub async fn rewind_since_block(&self) -> Result<RewindReport, ConnectorError> {
        let mut report = RewindReport::default();
        let marker = self.store.chain_marker().await?;
        let required = self.ingestor.policy().required_confirmations;

        let since = self
            .chain
            .list_since_block(marker.as_deref(), required)
            .await?;

        for entry in &since.entries {
            match entry.category {
                EntryCategory::Receive => {
                    report.replayed += 1;
                    if self.ingestor.on_deposit(&DepositEvent::from(entry)).await?
                        == Ingested::Created
                    {
                        report.created += 1;
                    }
                }
                EntryCategory::Send => {
                    self.ingestor
                        .on_transaction_update(&entry.txid, entry.confirmations, Some(entry.time))
                        .await?;
                }
                EntryCategory::Other => {}
            }
        }

        self.store.set_chain_marker(&since.last_block).await?;
        debug!(marker = %since.last_block, "Chain marker advanced");
        Ok(report)
    }
}
