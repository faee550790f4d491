//! Settlement saga: all-or-nothing payout across a market's bets with
//! compensation on partial failure, keyed by saga id.
//!
//! The saga id is derived from the market id, so redelivered `marketSettled`
//! messages land on the same entity and replay the stored report instead of
//! settling twice. Per-bet settlement is idempotent on the saga id, which
//! keeps retries and crash recovery from double-crediting.

use crate::bet::{BetClient, SettlementOutcome, SettlementReceipt};
use crate::bet_index::{BetIndexError, MarketIndexClient};
use crate::events::EventPayload;
use crate::money::{Money, TransactionKind, DEFAULT_CURRENCY};
use crate::runtime::{
    decode_state, encode_state, Entity, EntityCommand, EntityContext, EntityKind, EntityRef,
    Runtime, RuntimeError,
};
use crate::wallet::WalletClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

const RETRY_BASE_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SagaError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Index(#[from] BetIndexError),
}

/// Deterministic saga address for a market settlement.
pub fn settlement_saga_id(market_id: &str) -> String {
    format!("settlement:{market_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    pub event_id: String,
    pub market_id: String,
    /// `None` means the market was voided; every bet is refunded.
    pub winning_selection_id: Option<String>,
    /// Explicit bet list; when absent the market index is consulted.
    pub bet_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SagaStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub saga_id: String,
    pub market_id: String,
    pub status: SagaStatus,
    pub processed_bet_ids: Vec<String>,
    pub failed_bet_ids: Vec<String>,
    pub skipped_bet_ids: Vec<String>,
    pub total_payouts: Money,
    pub attempt_number: u32,
    pub duration_ms: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettlementSagaState {
    saga_id: String,
    event_id: Option<String>,
    market_id: Option<String>,
    winning_selection_id: Option<String>,
    affected_bet_ids: Vec<String>,
    processed_bet_ids: Vec<String>,
    failed_bet_ids: Vec<String>,
    total_payouts: Option<Money>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempt_number: u32,
    last_error: Option<String>,
    report: Option<SettlementReport>,
}

impl SettlementSagaState {
    fn new(saga_id: &str) -> Self {
        Self {
            saga_id: saga_id.to_string(),
            event_id: None,
            market_id: None,
            winning_selection_id: None,
            affected_bet_ids: Vec::new(),
            processed_bet_ids: Vec::new(),
            failed_bet_ids: Vec::new(),
            total_payouts: None,
            started_at: None,
            completed_at: None,
            attempt_number: 0,
            last_error: None,
            report: None,
        }
    }
}

fn accumulate(total: &mut Option<Money>, amount: Money) {
    *total = Some(match total.take() {
        None => amount,
        Some(current) => current.add(&amount).unwrap_or(current),
    });
}

pub struct SettlementSagaEntity {
    state: SettlementSagaState,
}

impl SettlementSagaEntity {
    async fn execute(
        &mut self,
        request: SettlementRequest,
        ctx: &EntityContext,
    ) -> Result<SettlementReport, SagaError> {
        if let Some(report) = &self.state.report {
            debug!(saga_id = %self.state.saga_id, "settlement already ran; replaying report");
            return Ok(report.clone());
        }
        let started = Instant::now();
        let saga_id = self.state.saga_id.clone();
        self.state.event_id = Some(request.event_id.clone());
        self.state.market_id = Some(request.market_id.clone());
        self.state.winning_selection_id = request.winning_selection_id.clone();
        self.state.started_at = Some(Utc::now());

        let runtime = ctx.runtime().clone();

        // 1. enumerate affected bets
        let bet_ids = match request.bet_ids.clone() {
            Some(ids) => ids,
            None => {
                MarketIndexClient::new(&runtime, &request.market_id).bets(None).await?
            }
        };
        self.state.affected_bet_ids = bet_ids.clone();
        ctx.record_event(EventPayload::SettlementStarted {
            saga_id: saga_id.clone(),
            market_id: request.market_id.clone(),
            bet_count: bet_ids.len(),
        })
        .await?;

        // 2. compute each bet's outcome from its locked odds
        let mut skipped: Vec<String> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut pending: Vec<(String, SettlementOutcome)> = Vec::new();
        for bet_id in &bet_ids {
            match BetClient::new(&runtime, bet_id).get().await {
                Ok(bet) if bet.can_be_cashed_out() => {
                    let outcome = match &request.winning_selection_id {
                        None => SettlementOutcome::Void,
                        Some(winner) if *winner == bet.selection_id => {
                            SettlementOutcome::Won { payout: bet.potential_payout() }
                        }
                        Some(_) => SettlementOutcome::Lost,
                    };
                    pending.push((bet_id.clone(), outcome));
                }
                Ok(bet) => {
                    // already cashed out, voided or rejected; nothing to settle
                    debug!(saga_id = %saga_id, bet_id, status = ?bet.status, "skipping bet");
                    skipped.push(bet_id.clone());
                }
                Err(e) => {
                    warn!(saga_id = %saga_id, bet_id, error = %e, "could not read bet");
                    failed.push((bet_id.clone(), e.to_string()));
                }
            }
        }

        // 3. settle with a bounded retry budget for transient failures
        let max_attempts = ctx.config().settlement.max_attempts;
        let mut receipts: Vec<SettlementReceipt> = Vec::new();
        let mut attempt = 0;
        while !pending.is_empty() && attempt < max_attempts {
            attempt += 1;
            self.state.attempt_number = attempt;

            let round = join_all(pending.iter().map(|(bet_id, outcome)| {
                let client = BetClient::new(&runtime, bet_id);
                let outcome = outcome.clone();
                let saga_id = saga_id.clone();
                async move { client.settle(outcome, &saga_id).await }
            }))
            .await;

            let mut retry: Vec<(String, SettlementOutcome)> = Vec::new();
            for ((bet_id, outcome), result) in pending.into_iter().zip(round) {
                match result {
                    Ok(receipt) => {
                        self.state.processed_bet_ids.push(bet_id);
                        receipts.push(receipt);
                    }
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        debug!(saga_id = %saga_id, bet_id, attempt, error = %e,
                            "transient settlement failure, will retry");
                        self.state.last_error = Some(e.to_string());
                        retry.push((bet_id, outcome));
                    }
                    Err(e) => {
                        warn!(saga_id = %saga_id, bet_id, error = %e, "settlement failed");
                        self.state.last_error = Some(e.to_string());
                        failed.push((bet_id, e.to_string()));
                    }
                }
            }
            pending = retry;
            if !pending.is_empty() && attempt < max_attempts {
                let jitter = rand::thread_rng().gen_range(0..20);
                let delay = RETRY_BASE_DELAY_MS * (1 << (attempt - 1)) + jitter;
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        for (bet_id, _) in pending {
            failed.push((bet_id, "retry budget exhausted".to_string()));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.state.failed_bet_ids = failed.iter().map(|(id, _)| id.clone()).collect();

        let report = if failed.is_empty() {
            let mut total: Option<Money> = None;
            for receipt in &receipts {
                if let Some(paid) = receipt.paid {
                    accumulate(&mut total, paid);
                }
            }
            let total = total.unwrap_or_else(|| Money::zero(DEFAULT_CURRENCY));
            self.state.total_payouts = Some(total);
            self.state.completed_at = Some(Utc::now());
            ctx.record_event(EventPayload::SettlementCompleted {
                saga_id: saga_id.clone(),
                successful: true,
                total_payouts: total,
                duration_ms,
            })
            .await?;
            info!(saga_id = %saga_id, bets = receipts.len(), total = %total, "settlement completed");
            SettlementReport {
                saga_id: saga_id.clone(),
                market_id: request.market_id.clone(),
                status: SagaStatus::Completed,
                processed_bet_ids: self.state.processed_bet_ids.clone(),
                failed_bet_ids: Vec::new(),
                skipped_bet_ids: skipped,
                total_payouts: total,
                attempt_number: self.state.attempt_number,
                duration_ms,
                last_error: None,
            }
        } else {
            let error = self
                .state
                .last_error
                .clone()
                .unwrap_or_else(|| "settlement failed".to_string());
            warn!(saga_id = %saga_id, failed = failed.len(), settled = receipts.len(),
                "settlement failed; compensating settled bets");
            self.compensate(&runtime, &saga_id, &receipts).await;
            self.state.completed_at = Some(Utc::now());
            ctx.record_event(EventPayload::SettlementFailed {
                saga_id: saga_id.clone(),
                error: error.clone(),
                is_retryable: false,
            })
            .await?;
            SettlementReport {
                saga_id: saga_id.clone(),
                market_id: request.market_id.clone(),
                status: SagaStatus::Failed,
                processed_bet_ids: Vec::new(),
                failed_bet_ids: self.state.failed_bet_ids.clone(),
                skipped_bet_ids: skipped,
                total_payouts: Money::zero(DEFAULT_CURRENCY),
                attempt_number: self.state.attempt_number,
                duration_ms,
                last_error: Some(error),
            }
        };

        self.state.report = Some(report.clone());
        Ok(report)
    }

    /// Undo every settled bet: reverse credited payouts, refund committed
    /// stakes and roll the bet back to accepted. Individual compensation
    /// failures are logged and skipped; the receipts stay idempotent so an
    /// operator can re-drive them.
    async fn compensate(
        &mut self,
        runtime: &Runtime,
        saga_id: &str,
        receipts: &[SettlementReceipt],
    ) {
        for receipt in receipts {
            let bet = &receipt.bet;
            let wallet = WalletClient::new(runtime, &bet.user_id);
            if let Some(paid) = receipt.paid {
                if let Err(e) = wallet
                    .reverse_payout(paid, &bet.id, saga_id, "settlement compensation")
                    .await
                {
                    error!(saga_id, bet_id = %bet.id, error = %e, "payout reversal failed");
                }
            }
            if let Some(committed) = receipt.committed {
                let compensation_ref = format!("{saga_id}:compensation");
                if let Err(e) = wallet
                    .process_payout(
                        committed,
                        &bet.id,
                        &compensation_ref,
                        TransactionKind::BetRefund,
                    )
                    .await
                {
                    error!(saga_id, bet_id = %bet.id, error = %e, "stake refund failed");
                }
            }
            if let Err(e) = BetClient::new(runtime, &bet.id)
                .reverse_settlement(saga_id, "settlement compensation")
                .await
            {
                error!(saga_id, bet_id = %bet.id, error = %e, "bet rollback failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entity plumbing
// ---------------------------------------------------------------------------

pub enum SettlementSagaCommand {
    Execute {
        request: SettlementRequest,
        reply: oneshot::Sender<Result<SettlementReport, SagaError>>,
    },
    GetReport {
        reply: oneshot::Sender<Option<SettlementReport>>,
    },
}

impl EntityCommand for SettlementSagaCommand {
    fn method(&self) -> &'static str {
        match self {
            SettlementSagaCommand::Execute { .. } => "execute_settlement",
            SettlementSagaCommand::GetReport { .. } => "get_report",
        }
    }
}

#[async_trait]
impl Entity for SettlementSagaEntity {
    const KIND: EntityKind = EntityKind::SettlementSaga;
    type Command = SettlementSagaCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => SettlementSagaState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
        match command {
            SettlementSagaCommand::Execute { request, reply } => {
                let replayed = self.state.report.is_some();
                let result = self.execute(request, ctx).await;
                let _ = reply.send(result);
                !replayed
            }
            SettlementSagaCommand::GetReport { reply } => {
                let _ = reply.send(self.state.report.clone());
                false
            }
        }
    }
}

/// Typed handle; the saga id is the address.
#[derive(Clone)]
pub struct SettlementSagaClient {
    entity: EntityRef<SettlementSagaEntity>,
}

impl SettlementSagaClient {
    pub fn new(runtime: &Runtime, saga_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<SettlementSagaEntity>(saga_id) }
    }

    pub async fn execute(
        &self,
        request: SettlementRequest,
    ) -> Result<SettlementReport, SagaError> {
        self.entity.call(|reply| SettlementSagaCommand::Execute { request, reply }).await?
    }

    pub async fn report(&self) -> Result<Option<SettlementReport>, SagaError> {
        Ok(self.entity.call(|reply| SettlementSagaCommand::GetReport { reply }).await?)
    }
}

// ---------------------------------------------------------------------------
// Batch settlement
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BatchSettlementOutcome {
    pub reports: Vec<SettlementReport>,
    pub errors: Vec<String>,
    pub skipped: usize,
}

/// Run many settlements with bounded concurrency. A cancel signal stops
/// dispatching new requests; in-flight sagas run to their natural end.
pub async fn settle_batch(
    runtime: &Runtime,
    requests: Vec<SettlementRequest>,
    cancel: watch::Receiver<bool>,
) -> BatchSettlementOutcome {
    let concurrency = runtime.config().settlement.batch_concurrency.max(1);
    let results: Vec<Option<Result<SettlementReport, SagaError>>> =
        stream::iter(requests.into_iter().map(|request| {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            async move {
                if *cancel.borrow() {
                    return None;
                }
                let saga_id = settlement_saga_id(&request.market_id);
                Some(SettlementSagaClient::new(&runtime, &saga_id).execute(request).await)
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut outcome = BatchSettlementOutcome { reports: Vec::new(), errors: Vec::new(), skipped: 0 };
    for result in results {
        match result {
            None => outcome.skipped += 1,
            Some(Ok(report)) => outcome.reports.push(report),
            Some(Err(e)) => outcome.errors.push(e.to_string()),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bet::{BetStatus, BetType, PlaceBetRequest};
    use crate::config::Config;
    use crate::odds::OddsClient;
    use crate::runtime::testing::FaultInjector;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Arc;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn usd(units: i64) -> Money {
        Money::major(units, DEFAULT_CURRENCY)
    }

    async fn setup_market(runtime: &Runtime, market_id: &str) {
        OddsClient::new(runtime, market_id)
            .initialize_market(
                HashMap::from([
                    ("home".to_string(), d("2.10")),
                    ("away".to_string(), d("3.00")),
                ]),
                "test-feed",
            )
            .await
            .unwrap();
    }

    async fn place_bet(runtime: &Runtime, bet_id: &str, user: &str, selection: &str, stake: i64) {
        WalletClient::new(runtime, user).deposit(usd(1000), &format!("seed-{user}")).await.ok();
        let request = PlaceBetRequest {
            bet_id: bet_id.into(),
            user_id: user.into(),
            event_id: "e1".into(),
            market_id: "m1".into(),
            selection_id: selection.into(),
            amount: usd(stake),
            acceptable_odds: d("1.50"),
            bet_type: BetType::Single,
        };
        BetClient::new(runtime, bet_id).place(request).await.unwrap();
    }

    fn settle_request(bet_ids: &[&str], winner: Option<&str>) -> SettlementRequest {
        SettlementRequest {
            event_id: "e1".into(),
            market_id: "m1".into(),
            winning_selection_id: winner.map(|w| w.to_string()),
            bet_ids: Some(bet_ids.iter().map(|b| b.to_string()).collect()),
        }
    }

    #[tokio::test]
    async fn settles_winners_and_losers() {
        let runtime = Runtime::in_memory(Config::default());
        setup_market(&runtime, "m1").await;
        place_bet(&runtime, "b1", "alice", "home", 100).await;
        place_bet(&runtime, "b2", "bob", "away", 50).await;

        let saga = SettlementSagaClient::new(&runtime, &settlement_saga_id("m1"));
        let report = saga
            .execute(settle_request(&["b1", "b2"], Some("home")))
            .await
            .unwrap();

        assert_eq!(report.status, SagaStatus::Completed);
        assert_eq!(report.processed_bet_ids.len(), 2);
        assert_eq!(report.total_payouts.amount(), d("210.00"));

        // alice: 1000 - 100 + 210; bob: 1000 - 50
        let alice = WalletClient::new(&runtime, "alice").balance().await.unwrap();
        assert_eq!(alice.balance.amount(), d("1110"));
        let bob = WalletClient::new(&runtime, "bob").balance().await.unwrap();
        assert_eq!(bob.balance.amount(), d("950"));

        assert_eq!(BetClient::new(&runtime, "b1").get().await.unwrap().status, BetStatus::Won);
        assert_eq!(BetClient::new(&runtime, "b2").get().await.unwrap().status, BetStatus::Lost);
    }

    #[tokio::test]
    async fn re_execution_replays_the_stored_report() {
        let runtime = Runtime::in_memory(Config::default());
        setup_market(&runtime, "m1").await;
        place_bet(&runtime, "b1", "alice", "home", 100).await;

        let saga = SettlementSagaClient::new(&runtime, &settlement_saga_id("m1"));
        let first = saga.execute(settle_request(&["b1"], Some("home"))).await.unwrap();
        let replay = saga.execute(settle_request(&["b1"], Some("home"))).await.unwrap();
        assert_eq!(first, replay);

        // the balance was credited exactly once
        let alice = WalletClient::new(&runtime, "alice").balance().await.unwrap();
        assert_eq!(alice.balance.amount(), d("1110"));
    }

    #[tokio::test]
    async fn voided_market_refunds_stakes() {
        let runtime = Runtime::in_memory(Config::default());
        setup_market(&runtime, "m1").await;
        place_bet(&runtime, "b1", "alice", "home", 100).await;
        place_bet(&runtime, "b2", "bob", "away", 50).await;

        let saga = SettlementSagaClient::new(&runtime, &settlement_saga_id("m1"));
        let report = saga.execute(settle_request(&["b1", "b2"], None)).await.unwrap();
        assert_eq!(report.status, SagaStatus::Completed);

        let alice = WalletClient::new(&runtime, "alice").balance().await.unwrap();
        assert_eq!(alice.balance.amount(), d("1000"));
        assert_eq!(alice.available.amount(), d("1000"));
        assert_eq!(
            BetClient::new(&runtime, "b1").get().await.unwrap().status,
            BetStatus::Void
        );
    }

    #[tokio::test]
    async fn cashed_out_bets_are_skipped() {
        let runtime = Runtime::in_memory(Config::default());
        setup_market(&runtime, "m1").await;
        place_bet(&runtime, "b1", "alice", "home", 100).await;
        place_bet(&runtime, "b2", "alice", "home", 50).await;
        BetClient::new(&runtime, "b2").cash_out().await.unwrap();

        let saga = SettlementSagaClient::new(&runtime, &settlement_saga_id("m1"));
        let report = saga
            .execute(settle_request(&["b1", "b2"], Some("home")))
            .await
            .unwrap();
        assert_eq!(report.status, SagaStatus::Completed);
        assert_eq!(report.processed_bet_ids, vec!["b1"]);
        assert_eq!(report.skipped_bet_ids, vec!["b2"]);
    }

    #[tokio::test]
    async fn persistent_failure_compensates_settled_bets() {
        let faults = Arc::new(FaultInjector::new());
        let runtime = Runtime::builder(Config::default()).filter(faults.clone()).build();
        setup_market(&runtime, "m1").await;
        place_bet(&runtime, "b1", "alice", "home", 100).await;
        place_bet(&runtime, "b2", "bob", "home", 80).await;
        place_bet(&runtime, "b3", "carol", "away", 60).await;

        // b2 refuses to settle past the whole retry budget
        faults.fail(EntityKind::Bet, "b2", "settle_bet");

        let saga = SettlementSagaClient::new(&runtime, &settlement_saga_id("m1"));
        let report = saga
            .execute(settle_request(&["b1", "b2", "b3"], Some("home")))
            .await
            .unwrap();

        assert_eq!(report.status, SagaStatus::Failed);
        assert_eq!(report.failed_bet_ids, vec!["b2"]);
        assert!(report.processed_bet_ids.is_empty());
        assert_eq!(report.attempt_number, Config::default().settlement.max_attempts);

        // every settled bet was rolled back to accepted and balances match
        // their pre-settlement values
        for (user, bet_id) in [("alice", "b1"), ("carol", "b3")] {
            let bet = BetClient::new(&runtime, bet_id).get().await.unwrap();
            assert_eq!(bet.status, BetStatus::Accepted, "bet {bet_id}");
            let view = WalletClient::new(&runtime, user).balance().await.unwrap();
            assert_eq!(view.balance.amount(), d("1000"), "user {user}");
        }
        // the faulted bet was never settled
        let b2 = BetClient::new(&runtime, "b2").get().await.unwrap();
        assert_eq!(b2.status, BetStatus::Accepted);
        let bob = WalletClient::new(&runtime, "bob").balance().await.unwrap();
        assert_eq!(bob.balance.amount(), d("1000"));
    }

    #[tokio::test]
    async fn batch_settles_markets_and_honors_cancellation() {
        let runtime = Runtime::in_memory(Config::default());
        setup_market(&runtime, "m1").await;
        place_bet(&runtime, "b1", "alice", "home", 100).await;

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = settle_batch(
            &runtime,
            vec![settle_request(&["b1"], Some("home"))],
            cancel_rx,
        )
        .await;
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.skipped, 0);

        // a pre-cancelled batch dispatches nothing
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let outcome = settle_batch(
            &runtime,
            vec![settle_request(&["b1"], Some("home"))],
            cancel_rx,
        )
        .await;
        assert!(outcome.reports.is_empty());
        assert_eq!(outcome.skipped, 1);
    }
}
