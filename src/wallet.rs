//! Wallet entity: balance, reservations and idempotent money movements,
//! keyed by user id.
//!
//! Every mutation appends exactly one transaction and a balancing
//! debit/credit pair to the ledger. Failed operations leave balance and
//! reservations untouched but still append a failed transaction for audit.

use crate::events::EventPayload;
use crate::money::{
    Currency, EntryKind, LedgerEntry, Money, MoneyError, TransactionKind, WalletTransaction,
    DEFAULT_CURRENCY,
};
use crate::runtime::{
    decode_state, encode_state, Entity, EntityCommand, EntityContext, EntityKind, EntityRef,
    Runtime, RuntimeError,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::error;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum WalletError {
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: Decimal, requested: Decimal },
    #[error("a reservation already exists for bet {0}")]
    DuplicateReservation(String),
    #[error("no reservation found for bet {0}")]
    NoSuchReservation(String),
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("wallet invariant violated: {0}")]
    InvariantViolation(String),
}

impl WalletError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::Runtime(e) if e.is_transient())
    }
}

/// Result of a completed money movement. Replays of an already-processed
/// reference return the stored receipt unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletReceipt {
    pub transaction: WalletTransaction,
    pub balance: Money,
    pub available: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub balance: Money,
    pub reserved: Money,
    pub available: Money,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletState {
    user_id: String,
    currency: Option<Currency>,
    balance: Decimal,
    reserved: Decimal,
    reservations: HashMap<String, Decimal>,
    transactions: Vec<WalletTransaction>,
    ledger: Vec<LedgerEntry>,
    processed: HashMap<String, WalletReceipt>,
    #[serde(skip)]
    pending_events: Vec<EventPayload>,
}

impl WalletState {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            currency: None,
            balance: Decimal::ZERO,
            reserved: Decimal::ZERO,
            reservations: HashMap::new(),
            transactions: Vec::new(),
            ledger: Vec::new(),
            processed: HashMap::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn currency(&self) -> Currency {
        self.currency.unwrap_or(DEFAULT_CURRENCY)
    }

    fn money(&self, amount: Decimal) -> Money {
        Money::new(amount, self.currency()).unwrap_or_else(|_| Money::zero(self.currency()))
    }

    pub fn available(&self) -> Decimal {
        self.balance - self.reserved
    }

    pub fn balance_view(&self) -> BalanceView {
        BalanceView {
            balance: self.money(self.balance),
            reserved: self.money(self.reserved),
            available: self.money(self.available()),
        }
    }

    fn take_events(&mut self) -> Vec<EventPayload> {
        std::mem::take(&mut self.pending_events)
    }

    /// Adopt the wallet currency on first use; afterwards reject mismatches.
    fn accept_currency(&mut self, amount: &Money) -> Result<(), WalletError> {
        match self.currency {
            None => {
                self.currency = Some(amount.currency());
                Ok(())
            }
            Some(current) if current == amount.currency() => Ok(()),
            Some(current) => {
                Err(MoneyError::CurrencyMismatch(current, amount.currency()).into())
            }
        }
    }

    fn receipt(&self, transaction: WalletTransaction) -> WalletReceipt {
        WalletReceipt {
            transaction,
            balance: self.money(self.balance),
            available: self.money(self.available()),
        }
    }

    /// Append the completed transaction plus its balancing ledger pair.
    fn record_movement(
        &mut self,
        kind: TransactionKind,
        amount: Money,
        reference: Option<String>,
        debit_description: &str,
        credit_description: &str,
    ) -> WalletTransaction {
        let transaction =
            WalletTransaction::completed(&self.user_id, kind, amount, reference);
        self.ledger.push(LedgerEntry::new(
            transaction.id,
            amount,
            EntryKind::Debit,
            debit_description,
        ));
        self.ledger.push(LedgerEntry::new(
            transaction.id,
            amount,
            EntryKind::Credit,
            credit_description,
        ));
        self.transactions.push(transaction.clone());
        self.enforce_invariants();
        transaction
    }

    /// Audit trail for rejected operations; balance and reservations are
    /// untouched.
    fn record_failure(
        &mut self,
        kind: TransactionKind,
        amount: Money,
        reference: Option<String>,
        error: &WalletError,
    ) {
        let transaction = WalletTransaction::failed(&self.user_id, kind, amount, reference);
        self.transactions.push(transaction);
        self.pending_events.push(EventPayload::TransactionFailed {
            user_id: self.user_id.clone(),
            kind,
            amount,
            reason: error.to_string(),
        });
    }

    /// Balance non-negativity, reservation bookkeeping and per-transaction
    /// ledger balance. A violation here is a fatal fault, not a business
    /// failure; it is logged for the operator and surfaced by tests.
    pub fn verify_invariants(&self) -> Result<(), String> {
        if self.balance < Decimal::ZERO {
            return Err(format!("negative balance: {}", self.balance));
        }
        if self.reserved > self.balance {
            return Err(format!(
                "reserved {} exceeds balance {}",
                self.reserved, self.balance
            ));
        }
        let total: Decimal = self.reservations.values().copied().sum();
        if total != self.reserved {
            return Err(format!(
                "reservation bookkeeping off: reserved {} vs sum {}",
                self.reserved, total
            ));
        }
        let mut per_txn: HashMap<uuid::Uuid, Decimal> = HashMap::new();
        for entry in &self.ledger {
            let signed = match entry.kind {
                EntryKind::Debit => entry.amount.amount(),
                EntryKind::Credit => -entry.amount.amount(),
            };
            *per_txn.entry(entry.transaction_id).or_default() += signed;
        }
        for (txn, net) in per_txn {
            if !net.is_zero() {
                return Err(format!("ledger unbalanced for transaction {txn}: {net}"));
            }
        }
        Ok(())
    }

    fn enforce_invariants(&self) {
        if let Err(violation) = self.verify_invariants() {
            error!(user_id = %self.user_id, violation, "wallet invariant violated");
        }
    }

    fn require_positive(&self, amount: &Money) -> Result<(), WalletError> {
        if amount.is_positive() {
            Ok(())
        } else {
            Err(WalletError::NonPositiveAmount)
        }
    }

    /// Common checks for operations that add funds.
    fn validate_credit(&mut self, amount: &Money) -> Result<(), WalletError> {
        self.require_positive(amount)?;
        self.accept_currency(amount)
    }

    /// Common checks for operations that remove available funds.
    fn validate_debit(&mut self, amount: &Money) -> Result<(), WalletError> {
        self.require_positive(amount)?;
        self.accept_currency(amount)?;
        if self.available() < amount.amount() {
            return Err(WalletError::InsufficientFunds {
                available: self.available(),
                requested: amount.amount(),
            });
        }
        Ok(())
    }

    pub fn deposit(
        &mut self,
        amount: Money,
        txn_id: &str,
    ) -> Result<WalletReceipt, WalletError> {
        if let Some(receipt) = self.processed.get(txn_id) {
            return Ok(receipt.clone());
        }
        if let Err(e) = self.validate_credit(&amount) {
            self.record_failure(TransactionKind::Deposit, amount, Some(txn_id.to_string()), &e);
            return Err(e);
        }

        self.balance += amount.amount();
        let transaction = self.record_movement(
            TransactionKind::Deposit,
            amount,
            Some(txn_id.to_string()),
            "external settlement account",
            "wallet balance",
        );
        self.pending_events.push(EventPayload::FundsDeposited {
            user_id: self.user_id.clone(),
            amount,
            transaction_id: transaction.id,
        });
        let receipt = self.receipt(transaction);
        self.processed.insert(txn_id.to_string(), receipt.clone());
        Ok(receipt)
    }

    pub fn withdraw(
        &mut self,
        amount: Money,
        txn_id: &str,
    ) -> Result<WalletReceipt, WalletError> {
        if let Some(receipt) = self.processed.get(txn_id) {
            return Ok(receipt.clone());
        }
        if let Err(e) = self.validate_debit(&amount) {
            self.record_failure(TransactionKind::Withdrawal, amount, Some(txn_id.to_string()), &e);
            return Err(e);
        }

        self.balance -= amount.amount();
        let transaction = self.record_movement(
            TransactionKind::Withdrawal,
            amount,
            Some(txn_id.to_string()),
            "wallet balance",
            "external settlement account",
        );
        self.pending_events.push(EventPayload::FundsWithdrawn {
            user_id: self.user_id.clone(),
            amount,
            transaction_id: transaction.id,
        });
        let receipt = self.receipt(transaction);
        self.processed.insert(txn_id.to_string(), receipt.clone());
        Ok(receipt)
    }

    /// Earmark funds for a bet. Available-balance check and insertion are one
    /// step; the single-threaded mailbox makes the pair atomic.
    pub fn reserve(&mut self, amount: Money, bet_id: &str) -> Result<WalletReceipt, WalletError> {
        let check = if self.reservations.contains_key(bet_id) {
            Err(WalletError::DuplicateReservation(bet_id.to_string()))
        } else {
            self.validate_debit(&amount)
        };
        if let Err(e) = check {
            self.record_failure(TransactionKind::Reservation, amount, Some(bet_id.to_string()), &e);
            return Err(e);
        }

        self.reservations.insert(bet_id.to_string(), amount.amount());
        self.reserved += amount.amount();
        let transaction = self.record_movement(
            TransactionKind::Reservation,
            amount,
            Some(bet_id.to_string()),
            "available funds",
            "reserved funds",
        );
        self.pending_events.push(EventPayload::FundsReserved {
            user_id: self.user_id.clone(),
            bet_id: bet_id.to_string(),
            amount,
        });
        Ok(self.receipt(transaction))
    }

    /// Convert a reservation into a permanent debit.
    pub fn commit_reservation(&mut self, bet_id: &str) -> Result<WalletReceipt, WalletError> {
        let amount = match self.reservations.remove(bet_id) {
            Some(a) => a,
            None => {
                let e = WalletError::NoSuchReservation(bet_id.to_string());
                self.record_failure(
                    TransactionKind::ReservationCommit,
                    Money::zero(self.currency()),
                    Some(bet_id.to_string()),
                    &e,
                );
                return Err(e);
            }
        };
        self.reserved -= amount;
        self.balance -= amount;
        let money = self.money(amount);
        let transaction = self.record_movement(
            TransactionKind::ReservationCommit,
            money,
            Some(bet_id.to_string()),
            "wallet balance",
            "house stake account",
        );
        self.pending_events.push(EventPayload::ReservationCommitted {
            user_id: self.user_id.clone(),
            bet_id: bet_id.to_string(),
            amount: money,
        });
        Ok(self.receipt(transaction))
    }

    /// Cancel a reservation; balance unchanged.
    pub fn release_reservation(&mut self, bet_id: &str) -> Result<WalletReceipt, WalletError> {
        let amount = match self.reservations.remove(bet_id) {
            Some(a) => a,
            None => {
                let e = WalletError::NoSuchReservation(bet_id.to_string());
                self.record_failure(
                    TransactionKind::ReservationRelease,
                    Money::zero(self.currency()),
                    Some(bet_id.to_string()),
                    &e,
                );
                return Err(e);
            }
        };
        self.reserved -= amount;
        let money = self.money(amount);
        let transaction = self.record_movement(
            TransactionKind::ReservationRelease,
            money,
            Some(bet_id.to_string()),
            "reserved funds",
            "available funds",
        );
        self.pending_events.push(EventPayload::ReservationReleased {
            user_id: self.user_id.clone(),
            bet_id: bet_id.to_string(),
            amount: money,
        });
        Ok(self.receipt(transaction))
    }

    fn payout_reference(bet_id: &str, saga_id: &str) -> String {
        format!("payout:{bet_id}:{saga_id}")
    }

    fn reversal_reference(bet_id: &str, saga_id: &str) -> String {
        format!("payout-reversal:{bet_id}:{saga_id}")
    }

    pub fn process_payout(
        &mut self,
        amount: Money,
        bet_id: &str,
        saga_id: &str,
        kind: TransactionKind,
    ) -> Result<WalletReceipt, WalletError> {
        let reference = Self::payout_reference(bet_id, saga_id);
        if let Some(receipt) = self.processed.get(&reference) {
            return Ok(receipt.clone());
        }
        if let Err(e) = self.validate_credit(&amount) {
            self.record_failure(kind, amount, Some(reference), &e);
            return Err(e);
        }

        self.balance += amount.amount();
        let transaction = self.record_movement(
            kind,
            amount,
            Some(reference.clone()),
            "house payout account",
            "wallet balance",
        );
        self.pending_events.push(EventPayload::PayoutProcessed {
            user_id: self.user_id.clone(),
            bet_id: bet_id.to_string(),
            reference_id: reference.clone(),
            amount,
        });
        let receipt = self.receipt(transaction);
        self.processed.insert(reference, receipt.clone());
        Ok(receipt)
    }

    pub fn reverse_payout(
        &mut self,
        amount: Money,
        bet_id: &str,
        saga_id: &str,
        reason: &str,
    ) -> Result<WalletReceipt, WalletError> {
        let reference = Self::reversal_reference(bet_id, saga_id);
        if let Some(receipt) = self.processed.get(&reference) {
            return Ok(receipt.clone());
        }
        if let Err(e) = self.validate_debit(&amount) {
            self.record_failure(TransactionKind::PayoutReversal, amount, Some(reference), &e);
            return Err(e);
        }

        self.balance -= amount.amount();
        let transaction = self.record_movement(
            TransactionKind::PayoutReversal,
            amount,
            Some(reference.clone()),
            "wallet balance",
            "house payout account",
        );
        self.pending_events.push(EventPayload::PayoutReversed {
            user_id: self.user_id.clone(),
            bet_id: bet_id.to_string(),
            reference_id: reference.clone(),
            amount,
            reason: reason.to_string(),
        });
        let receipt = self.receipt(transaction);
        self.processed.insert(reference, receipt.clone());
        Ok(receipt)
    }

    pub fn transaction_history(&self, limit: usize) -> Vec<WalletTransaction> {
        self.transactions.iter().rev().take(limit).cloned().collect()
    }

    pub fn ledger_entries(&self, limit: usize) -> Vec<LedgerEntry> {
        self.ledger.iter().rev().take(limit).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Entity plumbing
// ---------------------------------------------------------------------------

pub enum WalletCommand {
    GetBalance {
        reply: oneshot::Sender<BalanceView>,
    },
    Deposit {
        amount: Money,
        txn_id: String,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    Withdraw {
        amount: Money,
        txn_id: String,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    Reserve {
        amount: Money,
        bet_id: String,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    CommitReservation {
        bet_id: String,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    ReleaseReservation {
        bet_id: String,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    ProcessPayout {
        amount: Money,
        bet_id: String,
        saga_id: String,
        kind: TransactionKind,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    ReversePayout {
        amount: Money,
        bet_id: String,
        saga_id: String,
        reason: String,
        reply: oneshot::Sender<Result<WalletReceipt, WalletError>>,
    },
    TransactionHistory {
        limit: usize,
        reply: oneshot::Sender<Vec<WalletTransaction>>,
    },
    LedgerEntries {
        limit: usize,
        reply: oneshot::Sender<Vec<LedgerEntry>>,
    },
}

impl EntityCommand for WalletCommand {
    fn method(&self) -> &'static str {
        match self {
            WalletCommand::GetBalance { .. } => "get_balance",
            WalletCommand::Deposit { .. } => "deposit",
            WalletCommand::Withdraw { .. } => "withdraw",
            WalletCommand::Reserve { .. } => "reserve",
            WalletCommand::CommitReservation { .. } => "commit_reservation",
            WalletCommand::ReleaseReservation { .. } => "release_reservation",
            WalletCommand::ProcessPayout { .. } => "process_payout",
            WalletCommand::ReversePayout { .. } => "reverse_payout",
            WalletCommand::TransactionHistory { .. } => "transaction_history",
            WalletCommand::LedgerEntries { .. } => "ledger_entries",
        }
    }
}

pub struct WalletEntity {
    state: WalletState,
}

impl WalletEntity {
    /// Record whatever the operation emitted; emptiness doubles as the
    /// "state changed" signal for persistence.
    async fn flush_events(&mut self, ctx: &EntityContext) -> bool {
        let events = self.state.take_events();
        if events.is_empty() {
            return false;
        }
        if let Err(e) = ctx.record_events(events).await {
            error!(aggregate = %ctx.aggregate_id(), error = %e, "failed to append wallet events");
        }
        true
    }
}

#[async_trait]
impl Entity for WalletEntity {
    const KIND: EntityKind = EntityKind::Wallet;
    type Command = WalletCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => WalletState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
        match command {
            WalletCommand::GetBalance { reply } => {
                let _ = reply.send(self.state.balance_view());
                false
            }
            WalletCommand::Deposit { amount, txn_id, reply } => {
                let result = self.state.deposit(amount, &txn_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::Withdraw { amount, txn_id, reply } => {
                let result = self.state.withdraw(amount, &txn_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::Reserve { amount, bet_id, reply } => {
                let result = self.state.reserve(amount, &bet_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::CommitReservation { bet_id, reply } => {
                let result = self.state.commit_reservation(&bet_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::ReleaseReservation { bet_id, reply } => {
                let result = self.state.release_reservation(&bet_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::ProcessPayout { amount, bet_id, saga_id, kind, reply } => {
                let result = self.state.process_payout(amount, &bet_id, &saga_id, kind);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::ReversePayout { amount, bet_id, saga_id, reason, reply } => {
                let result = self.state.reverse_payout(amount, &bet_id, &saga_id, &reason);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            WalletCommand::TransactionHistory { limit, reply } => {
                let _ = reply.send(self.state.transaction_history(limit));
                false
            }
            WalletCommand::LedgerEntries { limit, reply } => {
                let _ = reply.send(self.state.ledger_entries(limit));
                false
            }
        }
    }
}

/// Typed handle for callers; the user id is the address.
#[derive(Clone)]
pub struct WalletClient {
    entity: EntityRef<WalletEntity>,
}

impl WalletClient {
    pub fn new(runtime: &Runtime, user_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<WalletEntity>(user_id) }
    }

    pub async fn balance(&self) -> Result<BalanceView, WalletError> {
        Ok(self.entity.call(|reply| WalletCommand::GetBalance { reply }).await?)
    }

    /// Balance minus outstanding reservations.
    pub async fn available_balance(&self) -> Result<Money, WalletError> {
        Ok(self.balance().await?.available)
    }

    pub async fn deposit(&self, amount: Money, txn_id: &str) -> Result<WalletReceipt, WalletError> {
        let txn_id = txn_id.to_string();
        self.entity.call(|reply| WalletCommand::Deposit { amount, txn_id, reply }).await?
    }

    pub async fn withdraw(
        &self,
        amount: Money,
        txn_id: &str,
    ) -> Result<WalletReceipt, WalletError> {
        let txn_id = txn_id.to_string();
        self.entity.call(|reply| WalletCommand::Withdraw { amount, txn_id, reply }).await?
    }

    pub async fn reserve(&self, amount: Money, bet_id: &str) -> Result<WalletReceipt, WalletError> {
        let bet_id = bet_id.to_string();
        self.entity.call(|reply| WalletCommand::Reserve { amount, bet_id, reply }).await?
    }

    pub async fn commit_reservation(&self, bet_id: &str) -> Result<WalletReceipt, WalletError> {
        let bet_id = bet_id.to_string();
        self.entity.call(|reply| WalletCommand::CommitReservation { bet_id, reply }).await?
    }

    pub async fn release_reservation(&self, bet_id: &str) -> Result<WalletReceipt, WalletError> {
        let bet_id = bet_id.to_string();
        self.entity.call(|reply| WalletCommand::ReleaseReservation { bet_id, reply }).await?
    }

    pub async fn process_payout(
        &self,
        amount: Money,
        bet_id: &str,
        saga_id: &str,
        kind: TransactionKind,
    ) -> Result<WalletReceipt, WalletError> {
        let bet_id = bet_id.to_string();
        let saga_id = saga_id.to_string();
        self.entity
            .call(|reply| WalletCommand::ProcessPayout { amount, bet_id, saga_id, kind, reply })
            .await?
    }

    pub async fn reverse_payout(
        &self,
        amount: Money,
        bet_id: &str,
        saga_id: &str,
        reason: &str,
    ) -> Result<WalletReceipt, WalletError> {
        let bet_id = bet_id.to_string();
        let saga_id = saga_id.to_string();
        let reason = reason.to_string();
        self.entity
            .call(|reply| WalletCommand::ReversePayout { amount, bet_id, saga_id, reason, reply })
            .await?
    }

    pub async fn transaction_history(
        &self,
        limit: usize,
    ) -> Result<Vec<WalletTransaction>, WalletError> {
        Ok(self.entity.call(|reply| WalletCommand::TransactionHistory { limit, reply }).await?)
    }

    pub async fn ledger_entries(&self, limit: usize) -> Result<Vec<LedgerEntry>, WalletError> {
        Ok(self.entity.call(|reply| WalletCommand::LedgerEntries { limit, reply }).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::TransactionStatus;
    use proptest::prelude::*;

    fn usd(units: i64) -> Money {
        Money::major(units, DEFAULT_CURRENCY)
    }

    #[test]
    fn deposit_then_withdraw_tracks_balance() {
        let mut wallet = WalletState::new("u1");
        wallet.deposit(usd(1000), "t1").unwrap();
        let receipt = wallet.withdraw(usd(400), "t2").unwrap();
        assert_eq!(receipt.balance.amount(), Decimal::from(600));
        wallet.verify_invariants().unwrap();
    }

    #[test]
    fn withdraw_beyond_available_fails_and_is_audited() {
        let mut wallet = WalletState::new("u1");
        wallet.deposit(usd(100), "t1").unwrap();
        wallet.reserve(usd(80), "bet1").unwrap();

        let err = wallet.withdraw(usd(50), "t2").unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));

        // balance untouched, failed transaction recorded
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(100));
        let last = wallet.transaction_history(1).remove(0);
        assert_eq!(last.status, TransactionStatus::Failed);
        assert_eq!(last.kind, TransactionKind::Withdrawal);
        wallet.verify_invariants().unwrap();
    }

    #[test]
    fn deposit_is_idempotent_by_transaction_id() {
        let mut wallet = WalletState::new("u1");
        let first = wallet.deposit(usd(250), "t1").unwrap();
        let replay = wallet.deposit(usd(250), "t1").unwrap();
        assert_eq!(first.transaction.id, replay.transaction.id);
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(250));
        // replays do not emit events
        assert!(wallet.take_events().len() == 1); // only the original deposit
    }

    #[test]
    fn reserve_commit_release_lifecycle() {
        let mut wallet = WalletState::new("u1");
        wallet.deposit(usd(1000), "t1").unwrap();

        wallet.reserve(usd(300), "bet1").unwrap();
        assert_eq!(wallet.balance_view().available.amount(), Decimal::from(700));
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(1000));

        // duplicate bet id is a conflict, not an idempotent replay
        assert!(matches!(
            wallet.reserve(usd(300), "bet1"),
            Err(WalletError::DuplicateReservation(_))
        ));

        wallet.reserve(usd(200), "bet2").unwrap();
        wallet.commit_reservation("bet1").unwrap();
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(700));

        wallet.release_reservation("bet2").unwrap();
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(700));
        assert_eq!(wallet.balance_view().available.amount(), Decimal::from(700));

        assert!(matches!(
            wallet.commit_reservation("bet1"),
            Err(WalletError::NoSuchReservation(_))
        ));
        wallet.verify_invariants().unwrap();
    }

    #[test]
    fn five_reservations_of_300_against_1000_accept_exactly_three() {
        let mut wallet = WalletState::new("u1");
        wallet.deposit(usd(1000), "t1").unwrap();

        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..5 {
            match wallet.reserve(usd(300), &format!("bet{i}")) {
                Ok(_) => accepted += 1,
                Err(WalletError::InsufficientFunds { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(rejected, 2);
        assert_eq!(wallet.balance_view().available.amount(), Decimal::from(100));
        wallet.verify_invariants().unwrap();
    }

    #[test]
    fn payout_and_reversal_are_idempotent_per_saga() {
        let mut wallet = WalletState::new("u1");
        wallet.deposit(usd(100), "t1").unwrap();

        let first = wallet
            .process_payout(usd(210), "bet1", "saga1", TransactionKind::BetPayout)
            .unwrap();
        let replay = wallet
            .process_payout(usd(210), "bet1", "saga1", TransactionKind::BetPayout)
            .unwrap();
        assert_eq!(first.transaction.id, replay.transaction.id);
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(310));

        // a different saga is a different reference
        wallet
            .process_payout(usd(10), "bet1", "saga2", TransactionKind::BetPayout)
            .unwrap();
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(320));

        wallet.reverse_payout(usd(210), "bet1", "saga1", "settlement failed").unwrap();
        wallet.reverse_payout(usd(210), "bet1", "saga1", "settlement failed").unwrap();
        assert_eq!(wallet.balance_view().balance.amount(), Decimal::from(110));
        wallet.verify_invariants().unwrap();
    }

    #[test]
    fn currency_is_fixed_by_first_deposit() {
        let mut wallet = WalletState::new("u1");
        wallet.deposit(usd(100), "t1").unwrap();
        let eur = Money::major(10, Currency::parse("EUR").unwrap());
        assert!(matches!(
            wallet.deposit(eur, "t2"),
            Err(WalletError::Money(MoneyError::CurrencyMismatch(_, _)))
        ));
    }

    #[tokio::test]
    async fn concurrent_reservations_through_the_entity_accept_exactly_three() {
        let runtime = Runtime::in_memory(crate::config::Config::default());
        let wallet = WalletClient::new(&runtime, "u1");
        wallet.deposit(usd(1000), "t1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let wallet = wallet.clone();
            handles.push(tokio::spawn(async move {
                wallet.reserve(usd(300), &format!("bet{i}")).await
            }));
        }

        let mut accepted = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(WalletError::InsufficientFunds { .. }) => insufficient += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(insufficient, 2);

        let view = wallet.balance().await.unwrap();
        assert_eq!(view.available.amount(), Decimal::from(100));
    }

    // Random operation sequences; invariants 1-4 must hold after every step.
    proptest! {
        #[test]
        fn invariants_hold_over_random_operation_sequences(
            ops in prop::collection::vec(0u8..7, 1..60),
            amounts in prop::collection::vec(1i64..500, 1..60),
        ) {
            let mut wallet = WalletState::new("prop");
            wallet.deposit(usd(1000), "seed").unwrap();
            let n = ops.len().min(amounts.len());

            for i in 0..n {
                let amount = usd(amounts[i]);
                let bet = format!("bet{}", i % 7);
                let saga = format!("saga{}", i % 3);
                let _ = match ops[i] {
                    0 => wallet.deposit(amount, &format!("dep{i}")).map(|_| ()),
                    1 => wallet.withdraw(amount, &format!("wd{i}")).map(|_| ()),
                    2 => wallet.reserve(amount, &bet).map(|_| ()),
                    3 => wallet.commit_reservation(&bet).map(|_| ()),
                    4 => wallet.release_reservation(&bet).map(|_| ()),
                    5 => wallet
                        .process_payout(amount, &bet, &saga, TransactionKind::BetPayout)
                        .map(|_| ()),
                    _ => wallet.reverse_payout(amount, &bet, &saga, "prop").map(|_| ()),
                };
                prop_assert!(wallet.verify_invariants().is_ok(), "{:?}", wallet.verify_invariants());
            }
        }

        // Applying the same referenced operation twice equals applying it once.
        #[test]
        fn repeated_references_do_not_double_apply(amount in 1i64..1000) {
            let mut wallet = WalletState::new("prop");
            wallet.deposit(usd(2000), "seed").unwrap();

            wallet.deposit(usd(amount), "dup").unwrap();
            let after_first = wallet.balance_view().balance.amount();
            wallet.deposit(usd(amount), "dup").unwrap();
            prop_assert_eq!(after_first, wallet.balance_view().balance.amount());

            wallet.process_payout(usd(amount), "b", "s", TransactionKind::BetPayout).unwrap();
            let after_payout = wallet.balance_view().balance.amount();
            wallet.process_payout(usd(amount), "b", "s", TransactionKind::BetPayout).unwrap();
            prop_assert_eq!(after_payout, wallet.balance_view().balance.amount());
        }
    }
}
