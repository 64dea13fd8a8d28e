//! Ledger Core Types
//!
//! A `Transaction` is one of three shapes sharing an identity space:
//! a received deposit, a withdrawal request, or an executed withdrawal.
//!
//! ```text
//! send:    REQUESTED → PENDING → CONFIRMED
//!              └──────────────────↗
//! receive:             PENDING → CONFIRMED
//! ```
//!
//! `completed` flips to true once the main server acknowledged the
//! transaction in CONFIRMED state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chain::SendReceipt;
use crate::error::StoreError;

/// Operation id assigned by the main server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opid(String);

impl Opid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Opid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Opid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Opid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direction of value movement, immutable once set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Direction {
    Send = 0,
    Receive = 1,
}

impl Direction {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Direction::Send),
            1 => Some(Direction::Receive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status
///
/// IDs are ordered so that a forward transition always increases the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum TxStatus {
    /// Withdrawal accepted from the main server, not yet executed
    Requested = 0,
    /// On-chain, below the confirmation threshold
    Pending = 1,
    /// On-chain and final
    Confirmed = 2,
}

impl TxStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TxStatus::Requested),
            1 => Some(TxStatus::Pending),
            2 => Some(TxStatus::Confirmed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Requested => "requested",
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
        }
    }

    /// Forward-only transitions. Staying in place is allowed.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (TxStatus::Requested, TxStatus::Pending | TxStatus::Confirmed) => true,
            (TxStatus::Pending, TxStatus::Confirmed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural identity of a transaction record.
///
/// Receives are unique per (txid, account) because one chain transaction may
/// fund several of our accounts. Sends are unique per opid; several sends may
/// share one txid when they were batched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxKey {
    Receive { txid: String, account: String },
    Send { opid: Opid },
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKey::Receive { txid, account } => write!(f, "receive:{}:{}", txid, account),
            TxKey::Send { opid } => write!(f, "send:{}", opid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opid: Option<Opid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    pub account: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub completed: bool,
}

impl Transaction {
    /// A deposit observed on-chain
    pub fn receive(
        txid: impl Into<String>,
        account: impl Into<String>,
        amount: Decimal,
        status: TxStatus,
        confirmations: Option<u32>,
        timestamp: i64,
    ) -> Self {
        Self {
            opid: None,
            txid: Some(txid.into()),
            account: account.into(),
            direction: Direction::Receive,
            amount,
            status,
            confirmations,
            timestamp: Some(timestamp),
            completed: false,
        }
    }

    /// A withdrawal accepted from the main server, not yet executed
    pub fn withdrawal_request(opid: Opid, account: impl Into<String>, amount: Decimal) -> Self {
        Self {
            opid: Some(opid),
            txid: None,
            account: account.into(),
            direction: Direction::Send,
            amount,
            status: TxStatus::Requested,
            confirmations: None,
            timestamp: None,
            completed: false,
        }
    }

    pub fn key(&self) -> Result<TxKey, StoreError> {
        match self.direction {
            Direction::Receive => match &self.txid {
                Some(txid) => Ok(TxKey::Receive {
                    txid: txid.clone(),
                    account: self.account.clone(),
                }),
                None => Err(StoreError::Invariant("receive without txid".to_string())),
            },
            Direction::Send => match &self.opid {
                Some(opid) => Ok(TxKey::Send { opid: opid.clone() }),
                None => Err(StoreError::Invariant("send without opid".to_string())),
            },
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.amount <= Decimal::ZERO {
            return Err(StoreError::Invariant(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.completed && self.status != TxStatus::Confirmed {
            return Err(StoreError::Invariant(
                "completed requires confirmed status".to_string(),
            ));
        }
        match self.direction {
            Direction::Receive => {
                if self.status == TxStatus::Requested {
                    return Err(StoreError::Invariant(
                        "receive cannot be requested".to_string(),
                    ));
                }
                if self.txid.is_none() {
                    return Err(StoreError::Invariant("receive without txid".to_string()));
                }
            }
            Direction::Send => {
                if self.opid.is_none() {
                    return Err(StoreError::Invariant("send without opid".to_string()));
                }
                if (self.status == TxStatus::Requested) != self.txid.is_none() {
                    return Err(StoreError::Invariant(
                        "send has txid iff it left requested".to_string(),
                    ));
                }
            }
        }
        if self.status != TxStatus::Requested && self.timestamp.is_none() {
            return Err(StoreError::Invariant(
                "on-chain transaction without timestamp".to_string(),
            ));
        }
        Ok(())
    }

    /// Fold a fresh chain observation into the record.
    ///
    /// Never regresses status or confirmations. Returns true if anything changed.
    pub fn observe(
        &mut self,
        status: TxStatus,
        confirmations: Option<u32>,
        timestamp: Option<i64>,
    ) -> bool {
        let mut changed = false;

        if self.status != status && self.status.can_transition_to(status) {
            self.status = status;
            changed = true;
        }

        if let Some(c) = confirmations
            && self.confirmations.is_none_or(|old| c > old)
        {
            self.confirmations = Some(c);
            changed = true;
        }

        if self.timestamp.is_none() && timestamp.is_some() {
            self.timestamp = timestamp;
            changed = true;
        }

        changed
    }

    /// Apply the outcome of a successful send to a requested withdrawal.
    pub fn apply_receipt(&mut self, receipt: &SendReceipt) -> Result<(), StoreError> {
        if self.direction != Direction::Send || self.status != TxStatus::Requested {
            return Err(StoreError::Invariant(format!(
                "receipt applied to {} {} record",
                self.status, self.direction
            )));
        }
        self.txid = Some(receipt.txid.clone());
        self.status = receipt.status;
        self.confirmations = receipt.confirmations;
        self.timestamp = Some(receipt.timestamp);
        Ok(())
    }

    pub fn mark_completed(&mut self) -> bool {
        if self.status == TxStatus::Confirmed && !self.completed {
            self.completed = true;
            true
        } else {
            false
        }
    }
}

/// A registered deposit account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    /// Last block known to be processed for this account (frontier marker)
    #[serde(default)]
    pub last_block: Option<String>,
}

impl Account {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_block: None,
        }
    }
}

/// Outbox entry for a receive the main server has not acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub txid: String,
    pub account: String,
    pub record: Transaction,
    pub attempts: u32,
}

impl PendingDelivery {
    pub fn new(record: Transaction) -> Result<Self, StoreError> {
        match record.key()? {
            TxKey::Receive { txid, account } => Ok(Self {
                txid,
                account,
                record,
                attempts: 1,
            }),
            TxKey::Send { .. } => Err(StoreError::Invariant(
                "outbox only carries receives".to_string(),
            )),
        }
    }

    pub fn key(&self) -> TxKey {
        TxKey::Receive {
            txid: self.txid.clone(),
            account: self.account.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(n: i64) -> Decimal {
        Decimal::new(n, 0)
    }

    #[test]
    fn test_status_ids_round_trip() {
        for s in [TxStatus::Requested, TxStatus::Pending, TxStatus::Confirmed] {
            assert_eq!(TxStatus::from_id(s.id()), Some(s));
        }
        assert_eq!(TxStatus::from_id(7), None);
        assert_eq!(Direction::from_id(Direction::Receive.id()), Some(Direction::Receive));
    }

    #[test]
    fn test_forward_only_transitions() {
        assert!(TxStatus::Requested.can_transition_to(TxStatus::Pending));
        assert!(TxStatus::Requested.can_transition_to(TxStatus::Confirmed));
        assert!(TxStatus::Pending.can_transition_to(TxStatus::Confirmed));
        assert!(!TxStatus::Confirmed.can_transition_to(TxStatus::Pending));
        assert!(!TxStatus::Pending.can_transition_to(TxStatus::Requested));
    }

    #[test]
    fn test_receive_cannot_be_requested() {
        let mut tx = Transaction::receive("t1", "acc", dec(1), TxStatus::Pending, Some(0), 1);
        assert!(tx.validate().is_ok());
        tx.status = TxStatus::Requested;
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_amount_must_be_positive() {
        let tx = Transaction::withdrawal_request(Opid::from("op"), "dest", Decimal::ZERO);
        assert!(matches!(tx.validate(), Err(StoreError::Invariant(_))));
    }

    #[test]
    fn test_completed_requires_confirmed() {
        let mut tx = Transaction::receive("t1", "acc", dec(1), TxStatus::Pending, Some(1), 1);
        assert!(!tx.mark_completed());
        tx.completed = true;
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_send_txid_only_after_execution() {
        let mut tx = Transaction::withdrawal_request(Opid::from("op"), "dest", dec(5));
        assert!(tx.validate().is_ok());
        tx.txid = Some("early".into());
        assert!(tx.validate().is_err());

        let mut tx = Transaction::withdrawal_request(Opid::from("op"), "dest", dec(5));
        tx.apply_receipt(&SendReceipt {
            txid: "abc".into(),
            confirmations: Some(0),
            status: TxStatus::Pending,
            timestamp: 1_700_000_000_000,
        })
        .unwrap();
        assert!(tx.validate().is_ok());
        assert_eq!(tx.txid.as_deref(), Some("abc"));
        assert!(tx.apply_receipt(&SendReceipt {
            txid: "again".into(),
            confirmations: None,
            status: TxStatus::Pending,
            timestamp: 0,
        })
        .is_err());
    }

    #[test]
    fn test_observe_never_regresses() {
        let mut tx = Transaction::receive("t1", "acc", dec(1), TxStatus::Confirmed, Some(4), 1);
        assert!(!tx.observe(TxStatus::Pending, Some(2), Some(1)));
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert_eq!(tx.confirmations, Some(4));
        assert!(tx.observe(TxStatus::Confirmed, Some(5), None));
        assert_eq!(tx.confirmations, Some(5));
    }

    #[test]
    fn test_transaction_serializes_amount_as_string() {
        let tx = Transaction::receive("t1", "acc", Decimal::new(150, 2), TxStatus::Pending, None, 9);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["amount"], "1.50");
        assert_eq!(json["direction"], "receive");
        assert_eq!(json["status"], "pending");
        assert!(json.get("opid").is_none());
        assert!(json.get("confirmations").is_none());
    }

    #[test]
    fn test_outbox_rejects_sends() {
        let tx = Transaction::withdrawal_request(Opid::from("op"), "dest", dec(1));
        assert!(PendingDelivery::new(tx).is_err());
    }
}
