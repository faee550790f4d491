//! Bet entity: placement, odds-change protection, cash-out, void and
//! saga-driven settlement, keyed by bet id.
//!
//! Placement runs reserve -> lock -> accept; every step after the
//! reservation compensates by releasing it on failure. Settlement is
//! idempotent per saga id so retries and redelivered messages never
//! double-credit.

use crate::events::EventPayload;
use crate::money::{Money, MoneyError, TransactionKind};
use crate::odds::{OddsClient, OddsError};
use crate::runtime::{
    decode_state, encode_state, Entity, EntityCommand, EntityContext, EntityKind, EntityRef,
    Runtime, RuntimeError,
};
use crate::wallet::{WalletClient, WalletError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BetError {
    #[error("bet {0} already exists with a different request")]
    AlreadyExists(String),
    #[error("bet {0} has not been placed")]
    NotFound(String),
    #[error("odds moved below acceptable: current {current}, acceptable {acceptable}")]
    OddsChanged { current: Decimal, acceptable: Decimal },
    #[error("insufficient funds to reserve the stake")]
    InsufficientFunds,
    #[error("market is suspended: {0}")]
    MarketSuspended(String),
    #[error("unknown selection {0}")]
    UnknownSelection(String),
    #[error("bet {bet_id} cannot be {action} while {status:?}")]
    InvalidState { bet_id: String, action: &'static str, status: BetStatus },
    #[error("no settlement by saga {saga_id} to reverse on bet {bet_id}")]
    NoSettlementToReverse { bet_id: String, saga_id: String },
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Odds(#[from] OddsError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl BetError {
    pub fn is_transient(&self) -> bool {
        match self {
            BetError::Wallet(e) => e.is_transient(),
            BetError::Odds(e) => e.is_transient(),
            BetError::Runtime(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BetStatus {
    Pending,
    Accepted,
    Rejected,
    Won,
    Lost,
    Void,
    #[serde(rename = "cashOut")]
    CashedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BetType {
    Single,
    Accumulator,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub id: String,
    pub user_id: String,
    pub event_id: String,
    pub market_id: String,
    pub selection_id: String,
    pub amount: Money,
    pub odds: Decimal,
    pub status: BetStatus,
    pub bet_type: BetType,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub payout: Option<Money>,
    pub rejection_reason: Option<String>,
    pub void_reason: Option<String>,
}

impl Bet {
    pub fn potential_payout(&self) -> Money {
        // odds are validated positive at lock time
        self.amount
            .multiply(self.odds)
            .unwrap_or_else(|_| Money::zero(self.amount.currency()))
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, BetStatus::Won | BetStatus::Lost | BetStatus::Void)
    }

    pub fn can_be_voided(&self) -> bool {
        matches!(self.status, BetStatus::Accepted | BetStatus::Pending)
    }

    pub fn can_be_cashed_out(&self) -> bool {
        self.status == BetStatus::Accepted
    }

    /// Still awaiting an outcome: neither settled, rejected nor cashed out.
    pub fn is_open(&self) -> bool {
        matches!(self.status, BetStatus::Pending | BetStatus::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBetRequest {
    pub bet_id: String,
    pub user_id: String,
    pub event_id: String,
    pub market_id: String,
    pub selection_id: String,
    pub amount: Money,
    pub acceptable_odds: Decimal,
    pub bet_type: BetType,
}

/// Outcome assigned to a bet by the settlement saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettlementOutcome {
    Won { payout: Money },
    Lost,
    Void,
}

/// Stored per saga id; replays return it verbatim. `committed`/`paid` record
/// the wallet movements this settlement caused, which is exactly what the
/// saga's compensation needs to undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub bet: Bet,
    pub committed: Option<Money>,
    pub paid: Option<Money>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashOutResult {
    pub bet: Bet,
    pub gross_value: Money,
    pub payout: Money,
    pub fee: Money,
    pub cashed_out_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetHistoryEntry {
    pub status: BetStatus,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StoredRejection {
    OddsChanged { current: Decimal, acceptable: Decimal },
    InsufficientFunds,
    MarketSuspended(String),
    UnknownSelection(String),
}

impl StoredRejection {
    fn reason(&self) -> String {
        match self {
            StoredRejection::OddsChanged { current, acceptable } => {
                format!("odds changed: current {current}, acceptable {acceptable}")
            }
            StoredRejection::InsufficientFunds => "insufficient funds".to_string(),
            StoredRejection::MarketSuspended(reason) => {
                format!("market suspended: {reason}")
            }
            StoredRejection::UnknownSelection(selection) => {
                format!("unknown selection: {selection}")
            }
        }
    }

    fn to_error(&self) -> BetError {
        match self {
            StoredRejection::OddsChanged { current, acceptable } => {
                BetError::OddsChanged { current: *current, acceptable: *acceptable }
            }
            StoredRejection::InsufficientFunds => BetError::InsufficientFunds,
            StoredRejection::MarketSuspended(reason) => {
                BetError::MarketSuspended(reason.clone())
            }
            StoredRejection::UnknownSelection(selection) => {
                BetError::UnknownSelection(selection.clone())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BetEntityState {
    bet_id: String,
    bet: Option<Bet>,
    request: Option<PlaceBetRequest>,
    rejection: Option<StoredRejection>,
    stake_committed: bool,
    committed_by_saga: Option<String>,
    settlements: HashMap<String, SettlementReceipt>,
    #[serde(skip)]
    pending_events: Vec<EventPayload>,
    #[serde(skip)]
    dirty: bool,
}

impl BetEntityState {
    fn new(bet_id: &str) -> Self {
        Self {
            bet_id: bet_id.to_string(),
            bet: None,
            request: None,
            rejection: None,
            stake_committed: false,
            committed_by_saga: None,
            settlements: HashMap::new(),
            pending_events: Vec::new(),
            dirty: false,
        }
    }

    fn take_events(&mut self) -> Vec<EventPayload> {
        std::mem::take(&mut self.pending_events)
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn bet(&self) -> Result<&Bet, BetError> {
        self.bet.as_ref().ok_or_else(|| BetError::NotFound(self.bet_id.clone()))
    }
}

pub struct BetEntity {
    state: BetEntityState,
}

impl BetEntity {
    fn wallet(&self, ctx: &EntityContext) -> WalletClient {
        let user_id = self
            .state
            .bet
            .as_ref()
            .map(|b| b.user_id.clone())
            .or_else(|| self.state.request.as_ref().map(|r| r.user_id.clone()))
            .unwrap_or_default();
        WalletClient::new(ctx.runtime(), &user_id)
    }

    fn odds(&self, ctx: &EntityContext) -> OddsClient {
        let market_id = self
            .state
            .bet
            .as_ref()
            .map(|b| b.market_id.clone())
            .or_else(|| self.state.request.as_ref().map(|r| r.market_id.clone()))
            .unwrap_or_default();
        OddsClient::new(ctx.runtime(), &market_id)
    }

    /// Replay the stored placement outcome for an identical request.
    fn replay_placement(&self) -> Result<Bet, BetError> {
        if let Some(rejection) = &self.state.rejection {
            return Err(rejection.to_error());
        }
        self.state.bet().cloned()
    }

    /// Persist a rejected placement so replays observe the same answer.
    fn store_rejection(
        &mut self,
        request: PlaceBetRequest,
        rejection: StoredRejection,
    ) -> BetError {
        let error = rejection.to_error();
        let reason = rejection.reason();
        let bet = Bet {
            id: request.bet_id.clone(),
            user_id: request.user_id.clone(),
            event_id: request.event_id.clone(),
            market_id: request.market_id.clone(),
            selection_id: request.selection_id.clone(),
            amount: request.amount,
            odds: request.acceptable_odds,
            status: BetStatus::Rejected,
            bet_type: request.bet_type,
            placed_at: Utc::now(),
            settled_at: None,
            payout: None,
            rejection_reason: Some(reason.clone()),
            void_reason: None,
        };
        self.state.pending_events.push(EventPayload::BetPlaced {
            bet_id: bet.id.clone(),
            user_id: bet.user_id.clone(),
            event_id: bet.event_id.clone(),
            market_id: bet.market_id.clone(),
            selection_id: bet.selection_id.clone(),
            amount: bet.amount,
            odds: bet.odds,
        });
        self.state.pending_events.push(EventPayload::BetRejected {
            bet_id: bet.id.clone(),
            user_id: bet.user_id.clone(),
            reason,
        });
        self.state.bet = Some(bet);
        self.state.request = Some(request);
        self.state.rejection = Some(rejection);
        self.state.dirty = true;
        error
    }

    async fn place(
        &mut self,
        request: PlaceBetRequest,
        ctx: &EntityContext,
    ) -> Result<Bet, BetError> {
        if let Some(existing) = &self.state.request {
            if *existing == request {
                return self.replay_placement();
            }
            return Err(BetError::AlreadyExists(self.state.bet_id.clone()));
        }

        let odds_client = OddsClient::new(ctx.runtime(), &request.market_id);
        let snapshot = odds_client.current_odds().await?;
        if snapshot.is_suspended {
            let reason = snapshot.suspension_reason.unwrap_or_default();
            return Err(self.store_rejection(request, StoredRejection::MarketSuspended(reason)));
        }
        let current = match snapshot.selections.get(&request.selection_id) {
            Some(odds) => odds.decimal,
            None => {
                let selection = request.selection_id.clone();
                return Err(self
                    .store_rejection(request, StoredRejection::UnknownSelection(selection)));
            }
        };
        // acceptable odds is the minimum the user will take
        if current < request.acceptable_odds {
            let rejection = StoredRejection::OddsChanged {
                current,
                acceptable: request.acceptable_odds,
            };
            return Err(self.store_rejection(request, rejection));
        }

        let wallet = WalletClient::new(ctx.runtime(), &request.user_id);
        match wallet.reserve(request.amount, &request.bet_id).await {
            Ok(_) => {}
            Err(WalletError::InsufficientFunds { .. }) => {
                return Err(self.store_rejection(request, StoredRejection::InsufficientFunds));
            }
            // transient or structural failures leave no placement behind, so
            // the caller may retry the same bet id
            Err(e) => return Err(e.into()),
        }

        let locked =
            match odds_client.lock_odds_for_bet(&request.bet_id, &request.selection_id).await {
                Ok(odds) => odds,
                Err(e) => {
                    let _ = odds_client.unlock_odds(&request.bet_id).await;
                    if let Err(release) = wallet.release_reservation(&request.bet_id).await {
                        warn!(bet_id = %request.bet_id, error = %release,
                            "failed to release reservation while compensating");
                    }
                    return match e {
                        OddsError::MarketSuspended { reason, .. } => Err(self
                            .store_rejection(request, StoredRejection::MarketSuspended(reason))),
                        OddsError::UnknownSelection { selection, .. } => Err(self
                            .store_rejection(request, StoredRejection::UnknownSelection(selection))),
                        other => Err(other.into()),
                    };
                }
            };

        // the lock captured the live odds; re-check against the floor in case
        // an update slipped in after the snapshot read
        if locked.decimal < request.acceptable_odds {
            let _ = odds_client.unlock_odds(&request.bet_id).await;
            if let Err(release) = wallet.release_reservation(&request.bet_id).await {
                warn!(bet_id = %request.bet_id, error = %release,
                    "failed to release reservation while compensating");
            }
            let rejection = StoredRejection::OddsChanged {
                current: locked.decimal,
                acceptable: request.acceptable_odds,
            };
            return Err(self.store_rejection(request, rejection));
        }

        let bet = Bet {
            id: request.bet_id.clone(),
            user_id: request.user_id.clone(),
            event_id: request.event_id.clone(),
            market_id: request.market_id.clone(),
            selection_id: request.selection_id.clone(),
            amount: request.amount,
            odds: locked.decimal,
            status: BetStatus::Accepted,
            bet_type: request.bet_type,
            placed_at: Utc::now(),
            settled_at: None,
            payout: None,
            rejection_reason: None,
            void_reason: None,
        };
        self.state.pending_events.push(EventPayload::BetPlaced {
            bet_id: bet.id.clone(),
            user_id: bet.user_id.clone(),
            event_id: bet.event_id.clone(),
            market_id: bet.market_id.clone(),
            selection_id: bet.selection_id.clone(),
            amount: bet.amount,
            odds: bet.odds,
        });
        self.state.pending_events.push(EventPayload::BetAccepted {
            bet_id: bet.id.clone(),
            user_id: bet.user_id.clone(),
            market_id: bet.market_id.clone(),
            selection_id: bet.selection_id.clone(),
            odds: bet.odds,
        });
        self.state.bet = Some(bet.clone());
        self.state.request = Some(request);
        self.state.dirty = true;
        debug!(bet_id = %bet.id, odds = %bet.odds, "bet accepted");
        Ok(bet)
    }

    async fn void(&mut self, reason: String, ctx: &EntityContext) -> Result<Bet, BetError> {
        let bet = self.state.bet()?.clone();
        if !bet.can_be_voided() {
            return Err(BetError::InvalidState {
                bet_id: bet.id,
                action: "voided",
                status: bet.status,
            });
        }

        let wallet = self.wallet(ctx);
        let mut refund = None;
        if self.state.stake_committed {
            // stake already left the balance; refund it
            let receipt = wallet
                .process_payout(bet.amount, &bet.id, "void", TransactionKind::BetRefund)
                .await?;
            refund = Some(receipt.transaction.amount);
        } else {
            match wallet.release_reservation(&bet.id).await {
                Ok(_) | Err(WalletError::NoSuchReservation(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let _ = self.odds(ctx).unlock_odds(&bet.id).await;

        let stored = self.state.bet.as_mut().expect("bet checked above");
        stored.status = BetStatus::Void;
        stored.void_reason = Some(reason);
        stored.settled_at = Some(Utc::now());
        stored.payout = refund;
        let updated = stored.clone();
        self.state.pending_events.push(EventPayload::BetSettled {
            bet_id: updated.id.clone(),
            user_id: updated.user_id.clone(),
            status: BetStatus::Void,
            payout: updated.payout,
            saga_id: None,
        });
        self.state.dirty = true;
        Ok(updated)
    }

    async fn cash_out(&mut self, ctx: &EntityContext) -> Result<CashOutResult, BetError> {
        let bet = self.state.bet()?.clone();
        if !bet.can_be_cashed_out() {
            return Err(BetError::InvalidState {
                bet_id: bet.id,
                action: "cashed out",
                status: bet.status,
            });
        }

        let odds_client = self.odds(ctx);
        let snapshot = odds_client.current_odds().await?;
        let current = snapshot
            .selections
            .get(&bet.selection_id)
            .map(|o| o.decimal)
            .ok_or_else(|| BetError::UnknownSelection(bet.selection_id.clone()))?;

        let gross = bet.amount.multiply(current)?;
        let fee_factor = Decimal::ONE - ctx.config().betting.cashout_fee;
        let net = gross.multiply(fee_factor)?;
        let fee = gross.subtract(&net)?;

        let wallet = self.wallet(ctx);
        if !self.state.stake_committed {
            wallet.commit_reservation(&bet.id).await?;
            self.state.stake_committed = true;
            self.state.dirty = true;
        }
        // on failure here the bet stays accepted; the commit above is already
        // persisted so a retry will not double-commit
        wallet
            .process_payout(net, &bet.id, "cashout", TransactionKind::BetPayout)
            .await?;
        let _ = odds_client.unlock_odds(&bet.id).await;

        let now = Utc::now();
        let stored = self.state.bet.as_mut().expect("bet checked above");
        stored.status = BetStatus::CashedOut;
        stored.payout = Some(net);
        stored.settled_at = Some(now);
        let updated = stored.clone();
        self.state.pending_events.push(EventPayload::BetCashedOut {
            bet_id: updated.id.clone(),
            user_id: updated.user_id.clone(),
            gross_value: gross,
            payout: net,
        });
        self.state.dirty = true;
        Ok(CashOutResult { bet: updated, gross_value: gross, payout: net, fee, cashed_out_at: now })
    }

    async fn settle(
        &mut self,
        outcome: SettlementOutcome,
        saga_id: String,
        ctx: &EntityContext,
    ) -> Result<SettlementReceipt, BetError> {
        if let Some(receipt) = self.state.settlements.get(&saga_id) {
            return Ok(receipt.clone());
        }
        let bet = self.state.bet()?.clone();
        if bet.status != BetStatus::Accepted {
            return Err(BetError::InvalidState {
                bet_id: bet.id,
                action: "settled",
                status: bet.status,
            });
        }

        let wallet = self.wallet(ctx);
        let mut paid = None;

        match &outcome {
            SettlementOutcome::Won { payout } => {
                if !self.state.stake_committed {
                    wallet.commit_reservation(&bet.id).await?;
                    self.state.stake_committed = true;
                    self.state.committed_by_saga = Some(saga_id.clone());
                    self.state.dirty = true;
                }
                wallet
                    .process_payout(*payout, &bet.id, &saga_id, TransactionKind::BetWin)
                    .await?;
                paid = Some(*payout);
            }
            SettlementOutcome::Lost => {
                if !self.state.stake_committed {
                    wallet.commit_reservation(&bet.id).await?;
                    self.state.stake_committed = true;
                    self.state.committed_by_saga = Some(saga_id.clone());
                    self.state.dirty = true;
                }
            }
            SettlementOutcome::Void => {
                if self.state.stake_committed {
                    wallet
                        .process_payout(bet.amount, &bet.id, &saga_id, TransactionKind::BetRefund)
                        .await?;
                    paid = Some(bet.amount);
                } else {
                    match wallet.release_reservation(&bet.id).await {
                        Ok(_) | Err(WalletError::NoSuchReservation(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        let _ = self.odds(ctx).unlock_odds(&bet.id).await;

        let (status, payout) = match &outcome {
            SettlementOutcome::Won { payout } => (BetStatus::Won, Some(*payout)),
            SettlementOutcome::Lost => (BetStatus::Lost, None),
            SettlementOutcome::Void => (BetStatus::Void, paid),
        };
        let stored = self.state.bet.as_mut().expect("bet checked above");
        stored.status = status;
        stored.payout = payout;
        stored.settled_at = Some(Utc::now());
        if status == BetStatus::Void {
            stored.void_reason = Some("market voided".to_string());
        }
        let updated = stored.clone();

        let committed = (self.state.committed_by_saga.as_deref() == Some(saga_id.as_str()))
            .then_some(updated.amount);
        let receipt = SettlementReceipt { bet: updated.clone(), committed, paid };
        self.state.settlements.insert(saga_id.clone(), receipt.clone());
        self.state.pending_events.push(EventPayload::BetSettled {
            bet_id: updated.id.clone(),
            user_id: updated.user_id.clone(),
            status,
            payout,
            saga_id: Some(saga_id),
        });
        self.state.dirty = true;
        Ok(receipt)
    }

    /// Compensating rollback invoked by a failing saga. Wallet-side money is
    /// reversed by the saga itself; this only restores the bet's state.
    fn reverse_settlement(&mut self, saga_id: &str, reason: &str) -> Result<Bet, BetError> {
        if self.state.settlements.remove(saga_id).is_none() {
            return Err(BetError::NoSettlementToReverse {
                bet_id: self.state.bet_id.clone(),
                saga_id: saga_id.to_string(),
            });
        }
        let stored = match self.state.bet.as_mut() {
            Some(bet) => bet,
            None => return Err(BetError::NotFound(self.state.bet_id.clone())),
        };
        stored.status = BetStatus::Accepted;
        stored.payout = None;
        stored.settled_at = None;
        stored.void_reason = None;
        let updated = stored.clone();
        warn!(bet_id = %updated.id, saga_id, reason, "settlement reversed");
        self.state.pending_events.push(EventPayload::SettlementReversed {
            bet_id: updated.id.clone(),
            saga_id: saga_id.to_string(),
            reason: reason.to_string(),
        });
        self.state.dirty = true;
        Ok(updated)
    }

    /// Rebuild the bet's state timeline from its event stream.
    async fn history(&self, ctx: &EntityContext) -> Result<Vec<BetHistoryEntry>, BetError> {
        self.state.bet()?;
        let stream = ctx.read_own_stream().await?;
        let mut entries = Vec::new();
        for recorded in stream {
            let event = recorded.event;
            let entry = match event.payload {
                EventPayload::BetPlaced { odds, .. } => BetHistoryEntry {
                    status: BetStatus::Pending,
                    timestamp: event.timestamp,
                    detail: format!("placed at odds {odds}"),
                },
                EventPayload::BetAccepted { odds, .. } => BetHistoryEntry {
                    status: BetStatus::Accepted,
                    timestamp: event.timestamp,
                    detail: format!("accepted at odds {odds}"),
                },
                EventPayload::BetRejected { reason, .. } => BetHistoryEntry {
                    status: BetStatus::Rejected,
                    timestamp: event.timestamp,
                    detail: reason,
                },
                EventPayload::BetSettled { status, payout, saga_id, .. } => BetHistoryEntry {
                    status,
                    timestamp: event.timestamp,
                    detail: match (payout, saga_id) {
                        (Some(p), Some(s)) => format!("settled by saga {s}, payout {p}"),
                        (Some(p), None) => format!("settled, payout {p}"),
                        (None, Some(s)) => format!("settled by saga {s}"),
                        (None, None) => "settled".to_string(),
                    },
                },
                EventPayload::BetCashedOut { payout, .. } => BetHistoryEntry {
                    status: BetStatus::CashedOut,
                    timestamp: event.timestamp,
                    detail: format!("cashed out for {payout}"),
                },
                EventPayload::SettlementReversed { saga_id, reason, .. } => BetHistoryEntry {
                    status: BetStatus::Accepted,
                    timestamp: event.timestamp,
                    detail: format!("settlement by saga {saga_id} reversed: {reason}"),
                },
                _ => continue,
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn flush_events(&mut self, ctx: &EntityContext) -> bool {
        let events = self.state.take_events();
        let dirty = self.state.take_dirty();
        if !events.is_empty() {
            if let Err(e) = ctx.record_events(events).await {
                error!(aggregate = %ctx.aggregate_id(), error = %e, "failed to append bet events");
            }
        }
        dirty
    }
}

// ---------------------------------------------------------------------------
// Entity plumbing
// ---------------------------------------------------------------------------

pub enum BetCommand {
    Place {
        request: PlaceBetRequest,
        reply: oneshot::Sender<Result<Bet, BetError>>,
    },
    Get {
        reply: oneshot::Sender<Result<Bet, BetError>>,
    },
    Void {
        reason: String,
        reply: oneshot::Sender<Result<Bet, BetError>>,
    },
    CashOut {
        reply: oneshot::Sender<Result<CashOutResult, BetError>>,
    },
    Settle {
        outcome: SettlementOutcome,
        saga_id: String,
        reply: oneshot::Sender<Result<SettlementReceipt, BetError>>,
    },
    ReverseSettlement {
        saga_id: String,
        reason: String,
        reply: oneshot::Sender<Result<Bet, BetError>>,
    },
    History {
        reply: oneshot::Sender<Result<Vec<BetHistoryEntry>, BetError>>,
    },
}

impl EntityCommand for BetCommand {
    fn method(&self) -> &'static str {
        match self {
            BetCommand::Place { .. } => "place_bet",
            BetCommand::Get { .. } => "get_bet",
            BetCommand::Void { .. } => "void_bet",
            BetCommand::CashOut { .. } => "cash_out",
            BetCommand::Settle { .. } => "settle_bet",
            BetCommand::ReverseSettlement { .. } => "reverse_settlement",
            BetCommand::History { .. } => "bet_history",
        }
    }
}

#[async_trait]
impl Entity for BetEntity {
    const KIND: EntityKind = EntityKind::Bet;
    type Command = BetCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => BetEntityState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
        match command {
            BetCommand::Place { request, reply } => {
                let result = self.place(request, ctx).await;
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            BetCommand::Get { reply } => {
                let _ = reply.send(self.state.bet().cloned());
                false
            }
            BetCommand::Void { reason, reply } => {
                let result = self.void(reason, ctx).await;
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            BetCommand::CashOut { reply } => {
                let result = self.cash_out(ctx).await;
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            BetCommand::Settle { outcome, saga_id, reply } => {
                let result = self.settle(outcome, saga_id, ctx).await;
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            BetCommand::ReverseSettlement { saga_id, reason, reply } => {
                let result = self.reverse_settlement(&saga_id, &reason);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            BetCommand::History { reply } => {
                let _ = reply.send(self.history(ctx).await);
                false
            }
        }
    }
}

/// Typed handle; the bet id is the address.
#[derive(Clone)]
pub struct BetClient {
    entity: EntityRef<BetEntity>,
}

impl BetClient {
    pub fn new(runtime: &Runtime, bet_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<BetEntity>(bet_id) }
    }

    pub async fn place(&self, request: PlaceBetRequest) -> Result<Bet, BetError> {
        self.entity.call(|reply| BetCommand::Place { request, reply }).await?
    }

    pub async fn get(&self) -> Result<Bet, BetError> {
        self.entity.call(|reply| BetCommand::Get { reply }).await?
    }

    pub async fn void_bet(&self, reason: &str) -> Result<Bet, BetError> {
        let reason = reason.to_string();
        self.entity.call(|reply| BetCommand::Void { reason, reply }).await?
    }

    pub async fn cash_out(&self) -> Result<CashOutResult, BetError> {
        self.entity.call(|reply| BetCommand::CashOut { reply }).await?
    }

    pub async fn settle(
        &self,
        outcome: SettlementOutcome,
        saga_id: &str,
    ) -> Result<SettlementReceipt, BetError> {
        let saga_id = saga_id.to_string();
        self.entity.call(|reply| BetCommand::Settle { outcome, saga_id, reply }).await?
    }

    pub async fn reverse_settlement(
        &self,
        saga_id: &str,
        reason: &str,
    ) -> Result<Bet, BetError> {
        let saga_id = saga_id.to_string();
        let reason = reason.to_string();
        self.entity
            .call(|reply| BetCommand::ReverseSettlement { saga_id, reason, reply })
            .await?
    }

    pub async fn history(&self) -> Result<Vec<BetHistoryEntry>, BetError> {
        self.entity.call(|reply| BetCommand::History { reply }).await?
    }
}
