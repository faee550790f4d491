//! Bet indexes: the per-user index behind bet listings, and the per-market
//! index the settlement saga enumerates. Both are projections fed by the
//! `betAccepted` broker consumer; they hold bet ids only and fetch live bet
//! state through the bet entity.

use crate::bet::{Bet, BetClient};
use crate::runtime::{
    decode_state, encode_state, Entity, EntityCommand, EntityContext, EntityKind, EntityRef,
    Runtime, RuntimeError,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::warn;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BetIndexError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// One page of a user's bets, most recent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetPage {
    pub bets: Vec<Bet>,
    pub total_count: usize,
    pub page: usize,
    pub has_next_page: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BetIndexState {
    user_id: String,
    bet_ids: Vec<String>,
}

impl BetIndexState {
    fn new(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), bet_ids: Vec::new() }
    }

    fn add(&mut self, bet_id: &str) -> bool {
        if self.bet_ids.iter().any(|id| id == bet_id) {
            return false;
        }
        self.bet_ids.push(bet_id.to_string());
        true
    }

    fn contains(&self, bet_id: &str) -> bool {
        self.bet_ids.iter().any(|id| id == bet_id)
    }
}

pub struct BetIndexEntity {
    state: BetIndexState,
}

impl BetIndexEntity {
    /// Resolve every indexed id to its current bet state, newest placement
    /// first. Ids that no longer resolve are skipped with a warning.
    async fn fetch_sorted(&self, ctx: &EntityContext) -> Vec<Bet> {
        let runtime = ctx.runtime().clone();
        let lookups = self.state.bet_ids.iter().map(|bet_id| {
            let client = BetClient::new(&runtime, bet_id);
            async move { (bet_id.clone(), client.get().await) }
        });
        let mut bets = Vec::new();
        for (bet_id, result) in join_all(lookups).await {
            match result {
                Ok(bet) => bets.push(bet),
                Err(e) => {
                    warn!(user_id = %self.state.user_id, bet_id, error = %e,
                        "indexed bet did not resolve");
                }
            }
        }
        bets.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        bets
    }
}

pub enum BetIndexCommand {
    AddBet {
        bet_id: String,
        reply: oneshot::Sender<bool>,
    },
    HasBet {
        bet_id: String,
        reply: oneshot::Sender<bool>,
    },
    GetUserBets {
        page: usize,
        page_size: usize,
        reply: oneshot::Sender<Result<BetPage, BetIndexError>>,
    },
    GetActiveBets {
        reply: oneshot::Sender<Result<Vec<Bet>, BetIndexError>>,
    },
    GetBetHistory {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Bet>, BetIndexError>>,
    },
}

impl EntityCommand for BetIndexCommand {
    fn method(&self) -> &'static str {
        match self {
            BetIndexCommand::AddBet { .. } => "add_bet",
            BetIndexCommand::HasBet { .. } => "has_bet",
            BetIndexCommand::GetUserBets { .. } => "get_user_bets",
            BetIndexCommand::GetActiveBets { .. } => "get_active_bets",
            BetIndexCommand::GetBetHistory { .. } => "get_bet_history",
        }
    }
}

#[async_trait]
impl Entity for BetIndexEntity {
    const KIND: EntityKind = EntityKind::BetIndex;
    type Command = BetIndexCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => BetIndexState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
        match command {
            BetIndexCommand::AddBet { bet_id, reply } => {
                let added = self.state.add(&bet_id);
                let _ = reply.send(added);
                added
            }
            BetIndexCommand::HasBet { bet_id, reply } => {
                let _ = reply.send(self.state.contains(&bet_id));
                false
            }
            BetIndexCommand::GetUserBets { page, page_size, reply } => {
                let bets = self.fetch_sorted(ctx).await;
                let total_count = bets.len();
                let page_size = page_size.max(1);
                let start = page.saturating_mul(page_size);
                let slice: Vec<Bet> =
                    bets.into_iter().skip(start).take(page_size).collect();
                let has_next_page = start + slice.len() < total_count;
                let _ = reply.send(Ok(BetPage { bets: slice, total_count, page, has_next_page }));
                false
            }
            BetIndexCommand::GetActiveBets { reply } => {
                let bets = self.fetch_sorted(ctx).await;
                let active: Vec<Bet> = bets.into_iter().filter(|b| b.is_open()).collect();
                let _ = reply.send(Ok(active));
                false
            }
            BetIndexCommand::GetBetHistory { limit, reply } => {
                let bets = self.fetch_sorted(ctx).await;
                let settled: Vec<Bet> = bets
                    .into_iter()
                    .filter(|b| !b.is_open())
                    .take(limit)
                    .collect();
                let _ = reply.send(Ok(settled));
                false
            }
        }
    }
}

/// Typed handle; the user id is the address.
#[derive(Clone)]
pub struct BetIndexClient {
    entity: EntityRef<BetIndexEntity>,
}

impl BetIndexClient {
    pub fn new(runtime: &Runtime, user_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<BetIndexEntity>(user_id) }
    }

    pub async fn add_bet(&self, bet_id: &str) -> Result<bool, BetIndexError> {
        let bet_id = bet_id.to_string();
        Ok(self.entity.call(|reply| BetIndexCommand::AddBet { bet_id, reply }).await?)
    }

    pub async fn has_bet(&self, bet_id: &str) -> Result<bool, BetIndexError> {
        let bet_id = bet_id.to_string();
        Ok(self.entity.call(|reply| BetIndexCommand::HasBet { bet_id, reply }).await?)
    }

    pub async fn user_bets(&self, page: usize, page_size: usize) -> Result<BetPage, BetIndexError> {
        self.entity
            .call(|reply| BetIndexCommand::GetUserBets { page, page_size, reply })
            .await?
    }

    pub async fn active_bets(&self) -> Result<Vec<Bet>, BetIndexError> {
        self.entity.call(|reply| BetIndexCommand::GetActiveBets { reply }).await?
    }

    pub async fn bet_history(&self, limit: usize) -> Result<Vec<Bet>, BetIndexError> {
        self.entity.call(|reply| BetIndexCommand::GetBetHistory { limit, reply }).await?
    }
}

// ---------------------------------------------------------------------------
// Per-market index used by settlement
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct MarketIndexState {
    market_id: String,
    by_selection: HashMap<String, Vec<String>>,
    all: Vec<String>,
}

impl MarketIndexState {
    fn new(market_id: &str) -> Self {
        Self { market_id: market_id.to_string(), by_selection: HashMap::new(), all: Vec::new() }
    }

    fn add(&mut self, bet_id: &str, selection_id: &str) -> bool {
        if self.all.iter().any(|id| id == bet_id) {
            return false;
        }
        self.all.push(bet_id.to_string());
        self.by_selection
            .entry(selection_id.to_string())
            .or_default()
            .push(bet_id.to_string());
        true
    }

    fn bets(&self, selection: Option<&str>) -> Vec<String> {
        match selection {
            Some(s) => self.by_selection.get(s).cloned().unwrap_or_default(),
            None => self.all.clone(),
        }
    }
}

pub struct MarketIndexEntity {
    state: MarketIndexState,
}

pub enum MarketIndexCommand {
    AddBet {
        bet_id: String,
        selection_id: String,
        reply: oneshot::Sender<bool>,
    },
    GetBets {
        selection: Option<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
}

impl EntityCommand for MarketIndexCommand {
    fn method(&self) -> &'static str {
        match self {
            MarketIndexCommand::AddBet { .. } => "add_bet",
            MarketIndexCommand::GetBets { .. } => "get_bets",
        }
    }
}

#[async_trait]
impl Entity for MarketIndexEntity {
    const KIND: EntityKind = EntityKind::MarketIndex;
    type Command = MarketIndexCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => MarketIndexState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, _ctx: &EntityContext) -> bool {
        match command {
            MarketIndexCommand::AddBet { bet_id, selection_id, reply } => {
                let added = self.state.add(&bet_id, &selection_id);
                let _ = reply.send(added);
                added
            }
            MarketIndexCommand::GetBets { selection, reply } => {
                let _ = reply.send(self.state.bets(selection.as_deref()));
                false
            }
        }
    }
}

/// Typed handle; the market id is the address.
#[derive(Clone)]
pub struct MarketIndexClient {
    entity: EntityRef<MarketIndexEntity>,
}

impl MarketIndexClient {
    pub fn new(runtime: &Runtime, market_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<MarketIndexEntity>(market_id) }
    }

    pub async fn add_bet(&self, bet_id: &str, selection_id: &str) -> Result<bool, BetIndexError> {
        let bet_id = bet_id.to_string();
        let selection_id = selection_id.to_string();
        Ok(self
            .entity
            .call(|reply| MarketIndexCommand::AddBet { bet_id, selection_id, reply })
            .await?)
    }

    pub async fn bets(&self, selection: Option<&str>) -> Result<Vec<String>, BetIndexError> {
        let selection = selection.map(|s| s.to_string());
        Ok(self.entity.call(|reply| MarketIndexCommand::GetBets { selection, reply }).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bet::{BetStatus, BetType, PlaceBetRequest, SettlementOutcome};
    use crate::config::Config;
    use crate::money::{Money, DEFAULT_CURRENCY};
    use crate::odds::OddsClient;
    use crate::wallet::WalletClient;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn usd(units: i64) -> Money {
        Money::major(units, DEFAULT_CURRENCY)
    }

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    async fn place(runtime: &Runtime, bet_id: &str, selection: &str) {
        let request = PlaceBetRequest {
            bet_id: bet_id.into(),
            user_id: "u1".into(),
            event_id: "e1".into(),
            market_id: "m1".into(),
            selection_id: selection.into(),
            amount: usd(10),
            acceptable_odds: d("1.50"),
            bet_type: BetType::Single,
        };
        BetClient::new(runtime, bet_id).place(request).await.unwrap();
    }

    async fn setup(runtime: &Runtime) {
        let odds = OddsClient::new(runtime, "m1");
        odds.initialize_market(
            HashMap::from([("home".to_string(), d("2.00")), ("away".to_string(), d("3.00"))]),
            "test-feed",
        )
        .await
        .unwrap();
        WalletClient::new(runtime, "u1").deposit(usd(1000), "seed").await.unwrap();
    }

    #[test]
    fn add_is_a_set_operation() {
        let mut state = BetIndexState::new("u1");
        assert!(state.add("b1"));
        assert!(!state.add("b1"));
        assert!(state.add("b2"));
        assert!(state.contains("b1"));
        assert!(!state.contains("b9"));
    }

    #[tokio::test]
    async fn user_bets_are_paged_newest_first() {
        let runtime = Runtime::in_memory(Config::default());
        setup(&runtime).await;
        let index = BetIndexClient::new(&runtime, "u1");

        for i in 0..5 {
            let bet_id = format!("b{i}");
            place(&runtime, &bet_id, "home").await;
            index.add_bet(&bet_id).await.unwrap();
        }

        let page = index.user_bets(0, 2).await.unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.bets.len(), 2);
        assert!(page.has_next_page);
        // newest placements first
        assert!(page.bets[0].placed_at >= page.bets[1].placed_at);

        let last = index.user_bets(2, 2).await.unwrap();
        assert_eq!(last.bets.len(), 1);
        assert!(!last.has_next_page);
    }

    #[tokio::test]
    async fn active_and_history_views_split_by_state() {
        let runtime = Runtime::in_memory(Config::default());
        setup(&runtime).await;
        let index = BetIndexClient::new(&runtime, "u1");

        place(&runtime, "b1", "home").await;
        place(&runtime, "b2", "home").await;
        index.add_bet("b1").await.unwrap();
        index.add_bet("b2").await.unwrap();

        BetClient::new(&runtime, "b2")
            .settle(SettlementOutcome::Lost, "saga1")
            .await
            .unwrap();

        let active = index.active_bets().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b1");
        assert_eq!(active[0].status, BetStatus::Accepted);

        let history = index.bet_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "b2");
    }

    #[tokio::test]
    async fn market_index_tracks_selections() {
        let runtime = Runtime::in_memory(Config::default());
        let index = MarketIndexClient::new(&runtime, "m1");

        index.add_bet("b1", "home").await.unwrap();
        index.add_bet("b2", "away").await.unwrap();
        index.add_bet("b3", "home").await.unwrap();
        assert!(!index.add_bet("b1", "home").await.unwrap());

        assert_eq!(index.bets(None).await.unwrap().len(), 3);
        assert_eq!(index.bets(Some("home")).await.unwrap(), vec!["b1", "b3"]);
        assert_eq!(index.bets(Some("draw")).await.unwrap(), Vec::<String>::new());
    }
}
