//! Domain events as one tagged union.
//!
//! Every state mutation appends one or more of these to the owning
//! aggregate's stream; a background forwarder then publishes them to the
//! broker, partitioned by aggregate id.

use crate::bet::BetStatus;
use crate::market::{EventStatus, MarketStatus};
use crate::money::{Money, TransactionKind};
use crate::odds::VolatilityLevel;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: String,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(aggregate_id: &str, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            aggregate_id: aggregate_id.to_string(),
            payload,
        }
    }

    /// Broker topic: `{prefix}.{aggregate-class}.{kind}`, kind lowercased.
    pub fn topic(&self, prefix: &str) -> String {
        format!(
            "{}.{}.{}",
            prefix,
            self.payload.aggregate_class(),
            self.payload.kind().to_lowercase()
        )
    }
}

/// Aggregate classes used in topic names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateClass {
    Bet,
    Wallet,
    Event,
    Market,
    Odds,
    General,
}

impl AggregateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateClass::Bet => "bet",
            AggregateClass::Wallet => "wallet",
            AggregateClass::Event => "event",
            AggregateClass::Market => "market",
            AggregateClass::Odds => "odds",
            AggregateClass::General => "general",
        }
    }
}

impl std::fmt::Display for AggregateClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum EventPayload {
    // wallet
    FundsDeposited { user_id: String, amount: Money, transaction_id: Uuid },
    FundsWithdrawn { user_id: String, amount: Money, transaction_id: Uuid },
    FundsReserved { user_id: String, bet_id: String, amount: Money },
    ReservationCommitted { user_id: String, bet_id: String, amount: Money },
    ReservationReleased { user_id: String, bet_id: String, amount: Money },
    PayoutProcessed { user_id: String, bet_id: String, reference_id: String, amount: Money },
    PayoutReversed { user_id: String, bet_id: String, reference_id: String, amount: Money, reason: String },
    TransactionFailed { user_id: String, kind: TransactionKind, amount: Money, reason: String },

    // bet
    BetPlaced {
        bet_id: String,
        user_id: String,
        event_id: String,
        market_id: String,
        selection_id: String,
        amount: Money,
        odds: Decimal,
    },
    BetAccepted {
        bet_id: String,
        user_id: String,
        market_id: String,
        selection_id: String,
        odds: Decimal,
    },
    BetRejected { bet_id: String, user_id: String, reason: String },
    BetSettled {
        bet_id: String,
        user_id: String,
        status: BetStatus,
        payout: Option<Money>,
        saga_id: Option<String>,
    },
    BetCashedOut { bet_id: String, user_id: String, gross_value: Money, payout: Money },
    SettlementReversed { bet_id: String, saga_id: String, reason: String },

    // odds
    OddsInitialized { market_id: String, selections: HashMap<String, Decimal>, source: String },
    OddsUpdated {
        market_id: String,
        changes: HashMap<String, OddsChange>,
        source: String,
        reason: Option<String>,
    },
    OddsSuspended { market_id: String, reason: String, automatic: bool },
    OddsResumed { market_id: String, reason: String },
    OddsVolatilityChanged {
        market_id: String,
        previous: VolatilityLevel,
        current: VolatilityLevel,
        score: f64,
    },
    OddsLocked { market_id: String, bet_id: String, selection_id: String, odds: Decimal },
    OddsUnlocked { market_id: String, bet_id: String },

    // event / market lifecycle
    EventCreated { event_id: String, name: String, sport: String, start_time: DateTime<Utc> },
    EventStatusChanged { event_id: String, from: EventStatus, to: EventStatus },
    MarketAdded { event_id: String, market_id: String, name: String },
    MarketStatusChanged { event_id: String, market_id: String, from: MarketStatus, to: MarketStatus },
    MarketSettled { event_id: String, market_id: String, winning_selection: Option<String> },

    // settlement saga
    SettlementStarted { saga_id: String, market_id: String, bet_count: usize },
    SettlementCompleted { saga_id: String, successful: bool, total_payouts: Money, duration_ms: u64 },
    SettlementFailed { saga_id: String, error: String, is_retryable: bool },
}

/// Previous/new pair for one selection inside an `oddsUpdated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OddsChange {
    pub previous: Decimal,
    pub new: Decimal,
    pub percentage_change: Decimal,
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::FundsDeposited { .. } => "fundsDeposited",
            EventPayload::FundsWithdrawn { .. } => "fundsWithdrawn",
            EventPayload::FundsReserved { .. } => "fundsReserved",
            EventPayload::ReservationCommitted { .. } => "reservationCommitted",
            EventPayload::ReservationReleased { .. } => "reservationReleased",
            EventPayload::PayoutProcessed { .. } => "payoutProcessed",
            EventPayload::PayoutReversed { .. } => "payoutReversed",
            EventPayload::TransactionFailed { .. } => "transactionFailed",
            EventPayload::BetPlaced { .. } => "betPlaced",
            EventPayload::BetAccepted { .. } => "betAccepted",
            EventPayload::BetRejected { .. } => "betRejected",
            EventPayload::BetSettled { .. } => "betSettled",
            EventPayload::BetCashedOut { .. } => "betCashedOut",
            EventPayload::SettlementReversed { .. } => "settlementReversed",
            EventPayload::OddsInitialized { .. } => "oddsInitialized",
            EventPayload::OddsUpdated { .. } => "oddsUpdated",
            EventPayload::OddsSuspended { .. } => "oddsSuspended",
            EventPayload::OddsResumed { .. } => "oddsResumed",
            EventPayload::OddsVolatilityChanged { .. } => "oddsVolatilityChanged",
            EventPayload::OddsLocked { .. } => "oddsLocked",
            EventPayload::OddsUnlocked { .. } => "oddsUnlocked",
            EventPayload::EventCreated { .. } => "eventCreated",
            EventPayload::EventStatusChanged { .. } => "eventStatusChanged",
            EventPayload::MarketAdded { .. } => "marketAdded",
            EventPayload::MarketStatusChanged { .. } => "marketStatusChanged",
            EventPayload::MarketSettled { .. } => "marketSettled",
            EventPayload::SettlementStarted { .. } => "settlementStarted",
            EventPayload::SettlementCompleted { .. } => "settlementCompleted",
            EventPayload::SettlementFailed { .. } => "settlementFailed",
        }
    }

    pub fn aggregate_class(&self) -> AggregateClass {
        match self {
            EventPayload::FundsDeposited { .. }
            | EventPayload::FundsWithdrawn { .. }
            | EventPayload::FundsReserved { .. }
            | EventPayload::ReservationCommitted { .. }
            | EventPayload::ReservationReleased { .. }
            | EventPayload::PayoutProcessed { .. }
            | EventPayload::PayoutReversed { .. }
            | EventPayload::TransactionFailed { .. } => AggregateClass::Wallet,

            EventPayload::BetPlaced { .. }
            | EventPayload::BetAccepted { .. }
            | EventPayload::BetRejected { .. }
            | EventPayload::BetSettled { .. }
            | EventPayload::BetCashedOut { .. }
            | EventPayload::SettlementReversed { .. } => AggregateClass::Bet,

            EventPayload::OddsInitialized { .. }
            | EventPayload::OddsUpdated { .. }
            | EventPayload::OddsSuspended { .. }
            | EventPayload::OddsResumed { .. }
            | EventPayload::OddsVolatilityChanged { .. }
            | EventPayload::OddsLocked { .. }
            | EventPayload::OddsUnlocked { .. } => AggregateClass::Odds,

            EventPayload::EventCreated { .. } | EventPayload::EventStatusChanged { .. } => {
                AggregateClass::Event
            }

            EventPayload::MarketAdded { .. }
            | EventPayload::MarketStatusChanged { .. }
            | EventPayload::MarketSettled { .. } => AggregateClass::Market,

            EventPayload::SettlementStarted { .. }
            | EventPayload::SettlementCompleted { .. }
            | EventPayload::SettlementFailed { .. } => AggregateClass::General,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::DEFAULT_CURRENCY;

    #[test]
    fn topic_names_follow_prefix_class_kind() {
        let event = DomainEvent::new(
            "bet:abc",
            EventPayload::BetAccepted {
                bet_id: "abc".into(),
                user_id: "u1".into(),
                market_id: "m1".into(),
                selection_id: "home".into(),
                odds: Decimal::TWO,
            },
        );
        assert_eq!(event.topic("sportsbook"), "sportsbook.bet.betaccepted");
    }

    #[test]
    fn payloads_round_trip_through_json_with_type_tag() {
        let event = DomainEvent::new(
            "wallet:u1",
            EventPayload::FundsDeposited {
                user_id: "u1".into(),
                amount: Money::major(50, DEFAULT_CURRENCY),
                transaction_id: Uuid::new_v4(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "fundsDeposited");
        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload.kind(), "fundsDeposited");
    }
}
