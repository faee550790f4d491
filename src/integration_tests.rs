//! End-to-end scenarios across the fully wired engine: runtime, broker,
//! consumers, entities and the settlement saga, all on in-memory backends.

use crate::bet::{BetClient, BetError, BetStatus, BetType, PlaceBetRequest};
use crate::bet_index::MarketIndexClient;
use crate::broker::InMemoryBroker;
use crate::config::Config;
use crate::consumers::{spawn_consumers, EventDirectory};
use crate::events::EventPayload;
use crate::market::{AddMarketRequest, CreateEventRequest, SportEventClient};
use crate::money::{Money, DEFAULT_CURRENCY};
use crate::odds::{OddsClient, UpdateOddsRequest};
use crate::runtime::testing::FaultInjector;
use crate::runtime::{EntityKind, Runtime};
use crate::saga::{settlement_saga_id, SagaStatus, SettlementSagaClient};
use crate::wallet::{WalletClient, WalletError};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn usd(units: i64) -> Money {
    Money::major(units, DEFAULT_CURRENCY)
}

struct Harness {
    runtime: Runtime,
    faults: Arc<FaultInjector>,
}

impl Harness {
    fn new() -> Self {
        let broker = Arc::new(InMemoryBroker::default());
        let faults = Arc::new(FaultInjector::new());
        let runtime = Runtime::builder(Config::default())
            .publisher(broker.clone())
            .filter(faults.clone())
            .build();
        spawn_consumers(runtime.clone(), broker, EventDirectory::new());
        Self { runtime, faults }
    }

    async fn create_market(&self, event_id: &str, market_id: &str, selections: &[(&str, &str)]) {
        let outcomes: HashMap<String, Decimal> =
            selections.iter().map(|(s, o)| (s.to_string(), d(o))).collect();

        let events = SportEventClient::new(&self.runtime, event_id);
        events
            .create(CreateEventRequest {
                name: format!("event {event_id}"),
                sport: "football".into(),
                competition: "league".into(),
                start_time: Utc::now(),
                participants: vec![],
            })
            .await
            .unwrap();
        events
            .add_market(AddMarketRequest {
                market_id: market_id.into(),
                name: format!("market {market_id}"),
                description: String::new(),
                outcomes: outcomes.clone(),
            })
            .await
            .unwrap();

        OddsClient::new(&self.runtime, market_id)
            .initialize_market(outcomes, "integration-feed")
            .await
            .unwrap();
    }

    async fn place(
        &self,
        bet_id: &str,
        user: &str,
        market_id: &str,
        selection: &str,
        stake: i64,
        acceptable: &str,
    ) -> Result<crate::bet::Bet, BetError> {
        let request = PlaceBetRequest {
            bet_id: bet_id.into(),
            user_id: user.into(),
            event_id: "e1".into(),
            market_id: market_id.into(),
            selection_id: selection.into(),
            amount: usd(stake),
            acceptable_odds: d(acceptable),
            bet_type: BetType::Single,
        };
        BetClient::new(&self.runtime, bet_id).place(request).await
    }

    async fn wait_for_index(&self, market_id: &str, count: usize) {
        let index = MarketIndexClient::new(&self.runtime, market_id);
        eventually(|| {
            let index = index.clone();
            async move { index.bets(None).await.unwrap().len() >= count }
        })
        .await;
    }

    async fn wait_for_settlement(&self, market_id: &str) -> crate::saga::SettlementReport {
        let saga = SettlementSagaClient::new(&self.runtime, &settlement_saga_id(market_id));
        eventually(|| {
            let saga = saga.clone();
            async move { saga.report().await.unwrap().is_some() }
        })
        .await;
        saga.report().await.unwrap().unwrap()
    }

    async fn balance(&self, user: &str) -> Decimal {
        WalletClient::new(&self.runtime, user).balance().await.unwrap().balance.amount()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

// Scenario: happy-path win. Deposit 1000, bet 100 @ 2.10 on home_win,
// market completes with home_win. Final balance 1110, payout 210.
#[tokio::test]
async fn winning_bet_pays_out_through_the_full_pipeline() {
    let h = Harness::new();
    h.create_market("e1", "m1", &[("home_win", "2.10"), ("away_win", "3.20")]).await;
    WalletClient::new(&h.runtime, "u1").deposit(usd(1000), "t1").await.unwrap();

    let bet = h.place("b1", "u1", "m1", "home_win", 100, "2.10").await.unwrap();
    assert_eq!(bet.status, BetStatus::Accepted);
    h.wait_for_index("m1", 1).await;

    SportEventClient::new(&h.runtime, "e1").set_market_result("m1", "home_win").await.unwrap();

    let report = h.wait_for_settlement("m1").await;
    assert_eq!(report.status, SagaStatus::Completed);
    assert_eq!(report.total_payouts.amount(), d("210.00"));

    assert_eq!(h.balance("u1").await, d("1110"));
    let settled = BetClient::new(&h.runtime, "b1").get().await.unwrap();
    assert_eq!(settled.status, BetStatus::Won);
    assert_eq!(settled.payout.unwrap().amount(), d("210.00"));
}

// Scenario: happy-path loss. Deposit 500, bet 100 @ 2.00 on home, market
// settles away. Balance 400, payout none.
#[tokio::test]
async fn losing_bet_commits_the_stake() {
    let h = Harness::new();
    h.create_market("e1", "m2", &[("home", "2.00"), ("away", "2.00")]).await;
    WalletClient::new(&h.runtime, "u2").deposit(usd(500), "t1").await.unwrap();

    h.place("b2", "u2", "m2", "home", 100, "2.00").await.unwrap();
    h.wait_for_index("m2", 1).await;
    SportEventClient::new(&h.runtime, "e1").set_market_result("m2", "away").await.unwrap();

    let report = h.wait_for_settlement("m2").await;
    assert_eq!(report.status, SagaStatus::Completed);

    assert_eq!(h.balance("u2").await, d("400"));
    let settled = BetClient::new(&h.runtime, "b2").get().await.unwrap();
    assert_eq!(settled.status, BetStatus::Lost);
    assert!(settled.payout.is_none());
}

// Scenario: concurrent reservations. Five simultaneous 300-unit bets
// against a 1000 balance: exactly three succeed, the rest fail with
// insufficient funds, and the available balance ends at 100.
#[tokio::test]
async fn concurrent_bets_cannot_overdraw_the_wallet() {
    let h = Harness::new();
    h.create_market("e1", "m3", &[("home", "1.80")]).await;
    WalletClient::new(&h.runtime, "u3").deposit(usd(1000), "t1").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let runtime = h.runtime.clone();
        handles.push(tokio::spawn(async move {
            let bet_id = format!("c{i}");
            let request = PlaceBetRequest {
                bet_id: bet_id.clone(),
                user_id: "u3".into(),
                event_id: "e1".into(),
                market_id: "m3".into(),
                selection_id: "home".into(),
                amount: usd(300),
                acceptable_odds: d("1.50"),
                bet_type: BetType::Single,
            };
            BetClient::new(&runtime, &bet_id).place(request).await
        }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(bet) => {
                assert_eq!(bet.status, BetStatus::Accepted);
                accepted += 1;
            }
            Err(BetError::InsufficientFunds) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(rejected, 2);

    let view = WalletClient::new(&h.runtime, "u3").balance().await.unwrap();
    assert_eq!(view.available.amount(), d("100"));
    assert_eq!(view.balance.amount(), d("1000"));
}

// Scenario: odds-change rejection. A bet with a 1.95 floor races an update
// to 1.90: it either locks 2.00 or fails with oddsChanged, and in the
// failure case no reservation survives.
#[tokio::test]
async fn odds_update_racing_a_placement_never_leaks_a_reservation() {
    let h = Harness::new();
    h.create_market("e1", "m4", &[("home", "2.00")]).await;
    WalletClient::new(&h.runtime, "u4").deposit(usd(500), "t1").await.unwrap();

    let update = {
        let runtime = h.runtime.clone();
        tokio::spawn(async move {
            OddsClient::new(&runtime, "m4")
                .update_odds(UpdateOddsRequest {
                    market_id: "m4".into(),
                    selection_odds: HashMap::from([("home".to_string(), d("1.90"))]),
                    source: "integration-feed".into(),
                    reason: None,
                    updated_by: None,
                })
                .await
        })
    };
    let placement = h.place("b4", "u4", "m4", "home", 100, "1.95").await;
    update.await.unwrap().unwrap();

    let view = WalletClient::new(&h.runtime, "u4").balance().await.unwrap();
    match placement {
        Ok(bet) => {
            assert_eq!(bet.odds, d("2.00"));
            assert_eq!(view.available.amount(), d("400"));
        }
        Err(BetError::OddsChanged { .. }) => {
            assert_eq!(view.available.amount(), d("500"));
            assert_eq!(view.reserved.amount(), d("0"));
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
}

// Scenario: cash-out. Deposit 500, bet 100 @ 3.00, odds move to 2.00,
// cash out for 100 * 2.00 * 0.95 = 190. Balance 590.
#[tokio::test]
async fn cash_out_pays_the_discounted_live_value() {
    let h = Harness::new();
    h.create_market("e1", "m5", &[("home", "3.00")]).await;
    WalletClient::new(&h.runtime, "u5").deposit(usd(500), "t1").await.unwrap();

    h.place("b5", "u5", "m5", "home", 100, "3.00").await.unwrap();
    OddsClient::new(&h.runtime, "m5")
        .update_odds(UpdateOddsRequest {
            market_id: "m5".into(),
            selection_odds: HashMap::from([("home".to_string(), d("2.00"))]),
            source: "integration-feed".into(),
            reason: None,
            updated_by: None,
        })
        .await
        .unwrap();

    let result = BetClient::new(&h.runtime, "b5").cash_out().await.unwrap();
    assert_eq!(result.payout.amount(), d("190.00"));
    assert_eq!(result.bet.status, BetStatus::CashedOut);
    assert_eq!(h.balance("u5").await, d("590.00"));
}

// Scenario: saga compensation. Ten winning bets; bet f7 fails past the
// retry budget. Settled bets are reverted, the saga fails with a
// non-retryable settlementFailed event, and every balance matches its
// pre-settlement value.
#[tokio::test]
async fn partial_settlement_failure_restores_all_balances() {
    let h = Harness::new();
    h.create_market("e1", "m6", &[("home", "2.10"), ("away", "3.00")]).await;

    let users: Vec<String> = (1..=10).map(|i| format!("f-user{i}")).collect();
    for (i, user) in users.iter().enumerate() {
        WalletClient::new(&h.runtime, user).deposit(usd(1000), "seed").await.unwrap();
        h.place(&format!("f{}", i + 1), user, "m6", "home", 100, "2.00").await.unwrap();
    }
    h.wait_for_index("m6", 10).await;

    h.faults.fail(EntityKind::Bet, "f7", "settle_bet");
    SportEventClient::new(&h.runtime, "e1").set_market_result("m6", "home").await.unwrap();

    let report = h.wait_for_settlement("m6").await;
    assert_eq!(report.status, SagaStatus::Failed);
    assert_eq!(report.failed_bet_ids, vec!["f7"]);
    assert!(report.processed_bet_ids.is_empty());

    for (i, user) in users.iter().enumerate() {
        assert_eq!(h.balance(user).await, d("1000"), "balance of {user}");
        let bet = BetClient::new(&h.runtime, &format!("f{}", i + 1)).get().await.unwrap();
        assert_eq!(bet.status, BetStatus::Accepted, "bet f{}", i + 1);
    }

    // the saga stream records the non-retryable failure
    let saga_id = settlement_saga_id("m6");
    let stream = h
        .runtime
        .event_log()
        .read(&format!("settlement-saga:{saga_id}"), 0)
        .await
        .unwrap();
    assert!(stream.iter().any(|r| matches!(
        r.event.payload,
        EventPayload::SettlementFailed { is_retryable: false, .. }
    )));
}

// Invariant: per-aggregate event versions are strictly increasing without
// gaps, across every operation the scenarios above exercise.
#[tokio::test]
async fn wallet_event_stream_versions_are_gapless() {
    let h = Harness::new();
    let wallet = WalletClient::new(&h.runtime, "u7");
    wallet.deposit(usd(1000), "t1").await.unwrap();
    wallet.withdraw(usd(100), "t2").await.unwrap();
    wallet.reserve(usd(50), "bet-x").await.unwrap();
    wallet.release_reservation("bet-x").await.unwrap();
    let duplicate = wallet.withdraw(usd(5000), "t3").await;
    assert!(matches!(duplicate, Err(WalletError::InsufficientFunds { .. })));

    let stream = h.runtime.event_log().read("wallet:u7", 0).await.unwrap();
    assert!(!stream.is_empty());
    for (i, recorded) in stream.iter().enumerate() {
        assert_eq!(recorded.version, i as u64 + 1);
    }
    // the failed withdrawal is audited in the stream
    assert!(stream.iter().any(|r| matches!(
        r.event.payload,
        EventPayload::TransactionFailed { .. }
    )));
}

// Idempotent placement through a derived bet id: the same idempotency key
// resolves to the same entity, so the second post replays the first bet.
#[tokio::test]
async fn repeated_placement_with_one_bet_id_reserves_once() {
    let h = Harness::new();
    h.create_market("e1", "m8", &[("home", "2.00")]).await;
    WalletClient::new(&h.runtime, "u8").deposit(usd(1000), "t1").await.unwrap();

    let first = h.place("b8", "u8", "m8", "home", 100, "2.00").await.unwrap();
    let second = h.place("b8", "u8", "m8", "home", 100, "2.00").await.unwrap();
    assert_eq!(first, second);

    let view = WalletClient::new(&h.runtime, "u8").balance().await.unwrap();
    assert_eq!(view.reserved.amount(), d("100"));
}
