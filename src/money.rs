//! Money and double-entry ledger primitives.
//!
//! All amounts are fixed-point decimals with two fractional digits; arithmetic
//! across currencies is rejected rather than coerced.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Currency used for wallets created before their first deposit fixes one.
pub const DEFAULT_CURRENCY: Currency = Currency(*b"USD");

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount must not be negative: {0}")]
    NegativeAmount(Decimal),
    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(Currency, Currency),
    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),
    #[error("subtraction would go below zero: {minuend} - {subtrahend}")]
    Underflow { minuend: Decimal, subtrahend: Decimal },
}

/// Three-letter uppercase ISO-style currency code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Currency([u8; 3]);

impl Currency {
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // constructor guarantees ASCII
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.as_str())
    }
}

impl Serialize for Currency {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Currency::parse(&code).map_err(serde::de::Error::custom)
    }
}

/// A non-negative amount in a single currency, held at two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(MoneyError::NegativeAmount(amount));
        }
        Ok(Self { amount: round_2dp(amount), currency })
    }

    pub fn zero(currency: Currency) -> Self {
        Self { amount: Decimal::ZERO, currency }
    }

    /// Construct from whole major units, e.g. `Money::major(100, usd)` = 100.00.
    pub fn major(units: i64, currency: Currency) -> Self {
        Self { amount: Decimal::from(units), currency }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.require_same_currency(other)?;
        Ok(Money { amount: round_2dp(self.amount + other.amount), currency: self.currency })
    }

    pub fn subtract(&self, other: &Money) -> Result<Money, MoneyError> {
        self.require_same_currency(other)?;
        if other.amount > self.amount {
            return Err(MoneyError::Underflow { minuend: self.amount, subtrahend: other.amount });
        }
        Ok(Money { amount: round_2dp(self.amount - other.amount), currency: self.currency })
    }

    /// Scale by a non-negative factor (odds, fee multipliers), rounding
    /// half-away-from-zero to two decimal places.
    pub fn multiply(&self, factor: Decimal) -> Result<Money, MoneyError> {
        if factor.is_sign_negative() {
            return Err(MoneyError::NegativeAmount(factor));
        }
        Ok(Money { amount: round_2dp(self.amount * factor), currency: self.currency })
    }

    pub fn compare(&self, other: &Money) -> Result<std::cmp::Ordering, MoneyError> {
        self.require_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    fn require_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch(self.currency, other.currency));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.amount, self.currency)
    }
}

pub fn round_2dp(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// One side of a double-entry pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    Debit,
    Credit,
}

/// Immutable ledger line. Corrections are made by compensating transactions,
/// never by editing entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Money,
    pub kind: EntryKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(transaction_id: Uuid, amount: Money, kind: EntryKind, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            amount,
            kind,
            description: description.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    BetPlacement,
    BetWin,
    BetLoss,
    BetRefund,
    Reservation,
    ReservationCommit,
    ReservationRelease,
    BetPayout,
    PayoutReversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// A wallet money movement. Every completed transaction is backed by a
/// balancing debit/credit pair in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: Money,
    pub status: TransactionStatus,
    pub reference_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn completed(
        user_id: &str,
        kind: TransactionKind,
        amount: Money,
        reference_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            amount,
            status: TransactionStatus::Completed,
            reference_id,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        user_id: &str,
        kind: TransactionKind,
        amount: Money,
        reference_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            amount,
            status: TransactionStatus::Failed,
            reference_id,
            timestamp: Utc::now(),
        }
    }
}
