//! Odds entity: current snapshot, per-selection history, volatility scoring
//! and auto-suspension, keyed by market id.

use crate::events::{EventPayload, OddsChange};
use crate::money::round_2dp;
use crate::runtime::{
    decode_state, encode_state, Entity, EntityCommand, EntityContext, EntityKind, EntityRef,
    Runtime, RuntimeError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;
use tracing::{error, warn};

pub const AUTO_SUSPEND_REASON: &str = "automatic suspension due to extreme volatility";

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum OddsError {
    #[error("market {0} has no odds yet")]
    NotInitialized(String),
    #[error("market {0} is already initialized")]
    AlreadyInitialized(String),
    #[error("market {market_id} is suspended: {reason}")]
    MarketSuspended { market_id: String, reason: String },
    #[error("odds must be greater than zero, got {0}")]
    InvalidOdds(Decimal),
    #[error("unknown selection {selection} in market {market_id}")]
    UnknownSelection { market_id: String, selection: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl OddsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OddsError::Runtime(e) if e.is_transient())
    }
}

/// Decimal odds for one selection, with conversions to the other formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Odds {
    pub decimal: Decimal,
    pub market_id: String,
    pub selection: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Odds {
    pub fn new(
        decimal: Decimal,
        market_id: &str,
        selection: &str,
        source: &str,
    ) -> Result<Self, OddsError> {
        let rounded = round_2dp(decimal);
        if rounded <= Decimal::ZERO {
            return Err(OddsError::InvalidOdds(decimal));
        }
        Ok(Self {
            decimal: rounded,
            market_id: market_id.to_string(),
            selection: selection.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Fractional odds are the profit per unit stake: `decimal - 1`.
    pub fn to_fractional(&self) -> Decimal {
        self.decimal - Decimal::ONE
    }

    /// American odds: `(d-1)*100` for d >= 2, `-100/(d-1)` otherwise.
    pub fn to_american(&self) -> Result<Decimal, OddsError> {
        let edge = self.decimal - Decimal::ONE;
        if edge <= Decimal::ZERO {
            return Err(OddsError::InvalidOdds(self.decimal));
        }
        if self.decimal >= Decimal::TWO {
            Ok(round_2dp(edge * Decimal::ONE_HUNDRED))
        } else {
            Ok(round_2dp(-(Decimal::ONE_HUNDRED / edge)))
        }
    }

    pub fn implied_probability(&self) -> Decimal {
        (Decimal::ONE / self.decimal).round_dp(4)
    }

    pub fn decimal_from_fractional(fractional: Decimal) -> Decimal {
        round_2dp(fractional + Decimal::ONE)
    }

    pub fn decimal_from_american(american: Decimal) -> Result<Decimal, OddsError> {
        if american.is_zero() {
            return Err(OddsError::InvalidOdds(american));
        }
        if american > Decimal::ZERO {
            Ok(round_2dp(Decimal::ONE + american / Decimal::ONE_HUNDRED))
        } else {
            Ok(round_2dp(Decimal::ONE + Decimal::ONE_HUNDRED / -american))
        }
    }
}

/// One change in a selection's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OddsUpdate {
    pub previous: Decimal,
    pub new: Decimal,
    pub source: String,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OddsUpdate {
    pub fn percentage_change(&self) -> Decimal {
        if self.previous.is_zero() {
            return Decimal::ZERO;
        }
        ((self.new - self.previous).abs() / self.previous * Decimal::ONE_HUNDRED).round_dp(4)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OddsHistory {
    updates: Vec<OddsUpdate>,
}

impl OddsHistory {
    pub fn push(&mut self, update: OddsUpdate) {
        self.updates.push(update);
    }

    pub fn updates(&self) -> &[OddsUpdate] {
        &self.updates
    }

    /// Score over a window: sum of percentage changes, weighted by the
    /// change frequency (count / window hours).
    pub fn volatility_score(&self, window_hours: f64, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::milliseconds((window_hours * 3_600_000.0) as i64);
        let recent: Vec<&OddsUpdate> =
            self.updates.iter().filter(|u| u.updated_at > cutoff).collect();
        if recent.is_empty() {
            return 0.0;
        }
        let total: f64 = recent
            .iter()
            .map(|u| u.percentage_change().to_f64().unwrap_or(0.0))
            .sum();
        total * (recent.len() as f64 / window_hours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolatilityLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl VolatilityLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 10.0 {
            VolatilityLevel::Low
        } else if score < 25.0 {
            VolatilityLevel::Medium
        } else if score < 50.0 {
            VolatilityLevel::High
        } else {
            VolatilityLevel::Extreme
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOddsRequest {
    pub market_id: String,
    pub selection_odds: HashMap<String, Decimal>,
    pub source: String,
    pub reason: Option<String>,
    pub updated_by: Option<String>,
}

/// Read view returned by every odds operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OddsSnapshot {
    pub market_id: String,
    pub selections: HashMap<String, Odds>,
    pub timestamp: DateTime<Utc>,
    pub volatility_score: f64,
    pub volatility: VolatilityLevel,
    pub is_suspended: bool,
    pub suspension_reason: Option<String>,
    /// Overround: `(Σ implied probability - 1) * 100`.
    pub total_margin: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OddsState {
    market_id: String,
    initialized: bool,
    current: HashMap<String, Odds>,
    histories: HashMap<String, OddsHistory>,
    is_suspended: bool,
    suspension_reason: Option<String>,
    suspension_time: Option<DateTime<Utc>>,
    current_volatility: VolatilityLevel,
    /// selection -> bets holding the odds captured at their lock time.
    /// A lock records commitment; it does not freeze later updates.
    locked: HashMap<String, BTreeSet<String>>,
    volatility_window_hours: f64,
    volatility_threshold: f64,
    #[serde(skip)]
    pending_events: Vec<EventPayload>,
    #[serde(skip)]
    dirty: bool,
}

impl OddsState {
    pub fn new(market_id: &str) -> Self {
        Self {
            market_id: market_id.to_string(),
            initialized: false,
            current: HashMap::new(),
            histories: HashMap::new(),
            is_suspended: false,
            suspension_reason: None,
            suspension_time: None,
            current_volatility: VolatilityLevel::Low,
            locked: HashMap::new(),
            volatility_window_hours: 1.0,
            volatility_threshold: 50.0,
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

    fn require_initialized(&self) -> Result<(), OddsError> {
        if self.initialized {
            Ok(())
        } else {
            Err(OddsError::NotInitialized(self.market_id.clone()))
        }
    }

    fn require_open(&self) -> Result<(), OddsError> {
        self.require_initialized()?;
        if self.is_suspended {
            return Err(OddsError::MarketSuspended {
                market_id: self.market_id.clone(),
                reason: self.suspension_reason.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    pub fn market_volatility_score(&self, window_hours: f64, now: DateTime<Utc>) -> f64 {
        self.histories
            .values()
            .map(|h| h.volatility_score(window_hours, now))
            .fold(0.0, f64::max)
    }

    pub fn snapshot(&self) -> Result<OddsSnapshot, OddsError> {
        self.require_initialized()?;
        let score = self.market_volatility_score(self.volatility_window_hours, Utc::now());
        let margin: Decimal = self
            .current
            .values()
            .map(|o| o.implied_probability())
            .sum::<Decimal>()
            - Decimal::ONE;
        Ok(OddsSnapshot {
            market_id: self.market_id.clone(),
            selections: self.current.clone(),
            timestamp: Utc::now(),
            volatility_score: score,
            volatility: self.current_volatility,
            is_suspended: self.is_suspended,
            suspension_reason: self.suspension_reason.clone(),
            total_margin: round_2dp(margin * Decimal::ONE_HUNDRED),
        })
    }

    pub fn initialize(
        &mut self,
        initial: HashMap<String, Decimal>,
        source: &str,
        window_hours: f64,
        threshold: f64,
    ) -> Result<OddsSnapshot, OddsError> {
        if self.initialized {
            return Err(OddsError::AlreadyInitialized(self.market_id.clone()));
        }
        let mut selections = HashMap::new();
        for (selection, decimal) in &initial {
            let odds = Odds::new(*decimal, &self.market_id, selection, source)?;
            selections.insert(selection.clone(), odds);
        }
        self.current = selections;
        self.histories =
            initial.keys().map(|s| (s.clone(), OddsHistory::default())).collect();
        self.volatility_window_hours = window_hours;
        self.volatility_threshold = threshold;
        self.initialized = true;
        self.dirty = true;
        self.pending_events.push(EventPayload::OddsInitialized {
            market_id: self.market_id.clone(),
            selections: initial,
            source: source.to_string(),
        });
        self.snapshot()
    }

    pub fn update(&mut self, request: &UpdateOddsRequest) -> Result<OddsSnapshot, OddsError> {
        self.require_open()?;
        for decimal in request.selection_odds.values() {
            if round_2dp(*decimal) <= Decimal::ZERO {
                return Err(OddsError::InvalidOdds(*decimal));
            }
        }

        let now = Utc::now();
        let mut changes: HashMap<String, OddsChange> = HashMap::new();
        for (selection, decimal) in &request.selection_odds {
            let new = round_2dp(*decimal);
            let previous = self.current.get(selection).map(|o| o.decimal);
            if previous == Some(new) {
                continue;
            }
            let odds = Odds::new(new, &self.market_id, selection, &request.source)?;
            self.current.insert(selection.clone(), odds);
            self.dirty = true;

            // new selections start history on their first change
            let history = self.histories.entry(selection.clone()).or_default();
            if let Some(previous) = previous {
                let update = OddsUpdate {
                    previous,
                    new,
                    source: request.source.clone(),
                    reason: request.reason.clone(),
                    updated_at: now,
                };
                changes.insert(
                    selection.clone(),
                    OddsChange { previous, new, percentage_change: update.percentage_change() },
                );
                history.push(update);
            }
        }

        if !changes.is_empty() {
            self.pending_events.push(EventPayload::OddsUpdated {
                market_id: self.market_id.clone(),
                changes,
                source: request.source.clone(),
                reason: request.reason.clone(),
            });
        }

        let score = self.market_volatility_score(self.volatility_window_hours, now);
        let level = VolatilityLevel::from_score(score);
        if level != self.current_volatility {
            self.pending_events.push(EventPayload::OddsVolatilityChanged {
                market_id: self.market_id.clone(),
                previous: self.current_volatility,
                current: level,
                score,
            });
            self.current_volatility = level;
            self.dirty = true;
        }

        // extreme volatility suspends the market within the same operation
        if score >= self.volatility_threshold && !self.is_suspended {
            warn!(market_id = %self.market_id, score, "auto-suspending market");
            self.apply_suspension(AUTO_SUSPEND_REASON, true);
        }

        self.snapshot()
    }

    fn apply_suspension(&mut self, reason: &str, automatic: bool) {
        self.is_suspended = true;
        self.suspension_reason = Some(reason.to_string());
        self.suspension_time = Some(Utc::now());
        self.dirty = true;
        self.pending_events.push(EventPayload::OddsSuspended {
            market_id: self.market_id.clone(),
            reason: reason.to_string(),
            automatic,
        });
    }

    /// Idempotent; re-suspending returns the current snapshot unchanged.
    pub fn suspend(&mut self, reason: &str) -> Result<OddsSnapshot, OddsError> {
        self.require_initialized()?;
        if !self.is_suspended {
            self.apply_suspension(reason, false);
        }
        self.snapshot()
    }

    /// Idempotent; resuming an open market is a no-op.
    pub fn resume(&mut self, reason: &str) -> Result<OddsSnapshot, OddsError> {
        self.require_initialized()?;
        if self.is_suspended {
            self.is_suspended = false;
            self.suspension_reason = None;
            self.suspension_time = None;
            self.dirty = true;
            self.pending_events.push(EventPayload::OddsResumed {
                market_id: self.market_id.clone(),
                reason: reason.to_string(),
            });
        }
        self.snapshot()
    }

    /// Record that `bet_id` committed at the selection's current odds.
    pub fn lock_for_bet(&mut self, bet_id: &str, selection: &str) -> Result<Odds, OddsError> {
        self.require_open()?;
        let odds = self.current.get(selection).cloned().ok_or_else(|| {
            OddsError::UnknownSelection {
                market_id: self.market_id.clone(),
                selection: selection.to_string(),
            }
        })?;
        self.locked.entry(selection.to_string()).or_default().insert(bet_id.to_string());
        self.dirty = true;
        self.pending_events.push(EventPayload::OddsLocked {
            market_id: self.market_id.clone(),
            bet_id: bet_id.to_string(),
            selection_id: selection.to_string(),
            odds: odds.decimal,
        });
        Ok(odds)
    }

    /// Remove `bet_id` from every selection it locks.
    pub fn unlock(&mut self, bet_id: &str) -> Result<(), OddsError> {
        self.require_initialized()?;
        let mut removed = false;
        for bets in self.locked.values_mut() {
            removed |= bets.remove(bet_id);
        }
        self.locked.retain(|_, bets| !bets.is_empty());
        if removed {
            self.dirty = true;
            self.pending_events.push(EventPayload::OddsUnlocked {
                market_id: self.market_id.clone(),
                bet_id: bet_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn locks_for(&self, selection: &str) -> Option<&BTreeSet<String>> {
        self.locked.get(selection)
    }
}

// ---------------------------------------------------------------------------
// Entity plumbing
// ---------------------------------------------------------------------------

pub enum OddsCommand {
    Initialize {
        initial: HashMap<String, Decimal>,
        source: String,
        reply: oneshot::Sender<Result<OddsSnapshot, OddsError>>,
    },
    GetSnapshot {
        reply: oneshot::Sender<Result<OddsSnapshot, OddsError>>,
    },
    Update {
        request: UpdateOddsRequest,
        reply: oneshot::Sender<Result<OddsSnapshot, OddsError>>,
    },
    Suspend {
        reason: String,
        reply: oneshot::Sender<Result<OddsSnapshot, OddsError>>,
    },
    Resume {
        reason: String,
        reply: oneshot::Sender<Result<OddsSnapshot, OddsError>>,
    },
    LockForBet {
        bet_id: String,
        selection_id: String,
        reply: oneshot::Sender<Result<Odds, OddsError>>,
    },
    Unlock {
        bet_id: String,
        reply: oneshot::Sender<Result<(), OddsError>>,
    },
    VolatilityScore {
        window_hours: Option<f64>,
        reply: oneshot::Sender<Result<f64, OddsError>>,
    },
}

impl EntityCommand for OddsCommand {
    fn method(&self) -> &'static str {
        match self {
            OddsCommand::Initialize { .. } => "initialize_market",
            OddsCommand::GetSnapshot { .. } => "get_current_odds",
            OddsCommand::Update { .. } => "update_odds",
            OddsCommand::Suspend { .. } => "suspend_odds",
            OddsCommand::Resume { .. } => "resume_odds",
            OddsCommand::LockForBet { .. } => "lock_odds_for_bet",
            OddsCommand::Unlock { .. } => "unlock_odds",
            OddsCommand::VolatilityScore { .. } => "volatility_score",
        }
    }
}

pub struct OddsEntity {
    state: OddsState,
}

impl OddsEntity {
    async fn flush_events(&mut self, ctx: &EntityContext) -> bool {
        let events = self.state.take_events();
        let dirty = self.state.take_dirty();
        if !events.is_empty() {
            if let Err(e) = ctx.record_events(events).await {
                error!(aggregate = %ctx.aggregate_id(), error = %e, "failed to append odds events");
            }
        }
        dirty
    }
}

#[async_trait]
impl Entity for OddsEntity {
    const KIND: EntityKind = EntityKind::Odds;
    type Command = OddsCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => OddsState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
        match command {
            OddsCommand::Initialize { initial, source, reply } => {
                let odds_config = &ctx.config().odds;
                let result = self.state.initialize(
                    initial,
                    &source,
                    odds_config.volatility_window_hours,
                    odds_config.volatility_suspend_threshold,
                );
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            OddsCommand::GetSnapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
                false
            }
            OddsCommand::Update { request, reply } => {
                let result = self.state.update(&request);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            OddsCommand::Suspend { reason, reply } => {
                let result = self.state.suspend(&reason);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            OddsCommand::Resume { reason, reply } => {
                let result = self.state.resume(&reason);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            OddsCommand::LockForBet { bet_id, selection_id, reply } => {
                let result = self.state.lock_for_bet(&bet_id, &selection_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            OddsCommand::Unlock { bet_id, reply } => {
                let result = self.state.unlock(&bet_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            OddsCommand::VolatilityScore { window_hours, reply } => {
                let result = self.state.require_initialized().map(|_| {
                    let window =
                        window_hours.unwrap_or(self.state.volatility_window_hours);
                    self.state.market_volatility_score(window, Utc::now())
                });
                let _ = reply.send(result);
                false
            }
        }
    }
}

/// Typed handle; the market id is the address.
#[derive(Clone)]
pub struct OddsClient {
    entity: EntityRef<OddsEntity>,
}

impl OddsClient {
    pub fn new(runtime: &Runtime, market_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<OddsEntity>(market_id) }
    }

    pub async fn initialize_market(
        &self,
        initial: HashMap<String, Decimal>,
        source: &str,
    ) -> Result<OddsSnapshot, OddsError> {
        let source = source.to_string();
        self.entity.call(|reply| OddsCommand::Initialize { initial, source, reply }).await?
    }

    pub async fn current_odds(&self) -> Result<OddsSnapshot, OddsError> {
        self.entity.call(|reply| OddsCommand::GetSnapshot { reply }).await?
    }

    pub async fn update_odds(
        &self,
        request: UpdateOddsRequest,
    ) -> Result<OddsSnapshot, OddsError> {
        self.entity.call(|reply| OddsCommand::Update { request, reply }).await?
    }

    pub async fn suspend_odds(&self, reason: &str) -> Result<OddsSnapshot, OddsError> {
        let reason = reason.to_string();
        self.entity.call(|reply| OddsCommand::Suspend { reason, reply }).await?
    }

    pub async fn resume_odds(&self, reason: &str) -> Result<OddsSnapshot, OddsError> {
        let reason = reason.to_string();
        self.entity.call(|reply| OddsCommand::Resume { reason, reply }).await?
    }

    pub async fn lock_odds_for_bet(
        &self,
        bet_id: &str,
        selection_id: &str,
    ) -> Result<Odds, OddsError> {
        let bet_id = bet_id.to_string();
        let selection_id = selection_id.to_string();
        self.entity
            .call(|reply| OddsCommand::LockForBet { bet_id, selection_id, reply })
            .await?
    }

    pub async fn unlock_odds(&self, bet_id: &str) -> Result<(), OddsError> {
        let bet_id = bet_id.to_string();
        self.entity.call(|reply| OddsCommand::Unlock { bet_id, reply }).await?
    }

    pub async fn volatility_score(&self, window_hours: Option<f64>) -> Result<f64, OddsError> {
        self.entity.call(|reply| OddsCommand::VolatilityScore { window_hours, reply }).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn initialized_state(selections: &[(&str, &str)]) -> OddsState {
        let mut state = OddsState::new("m1");
        let initial: HashMap<String, Decimal> =
            selections.iter().map(|(s, o)| (s.to_string(), d(o))).collect();
        state.initialize(initial, "test-feed", 1.0, 50.0).unwrap();
        state.take_events();
        state
    }

    fn update_request(changes: &[(&str, &str)]) -> UpdateOddsRequest {
        UpdateOddsRequest {
            market_id: "m1".into(),
            selection_odds: changes.iter().map(|(s, o)| (s.to_string(), d(o))).collect(),
            source: "test-feed".into(),
            reason: None,
            updated_by: None,
        }
    }

    #[test]
    fn initialize_twice_fails() {
        let mut state = initialized_state(&[("home", "2.00")]);
        let err = state
            .initialize(HashMap::from([("home".to_string(), d("2.00"))]), "x", 1.0, 50.0)
            .unwrap_err();
        assert!(matches!(err, OddsError::AlreadyInitialized(_)));
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut state = OddsState::new("m1");
        assert!(matches!(state.snapshot(), Err(OddsError::NotInitialized(_))));
        assert!(matches!(state.lock_for_bet("b1", "home"), Err(OddsError::NotInitialized(_))));
    }

    #[test]
    fn margin_is_the_overround() {
        let state = initialized_state(&[("home", "2.00"), ("away", "2.00")]);
        // implied 0.5 + 0.5 = 1.0 -> margin 0
        assert_eq!(state.snapshot().unwrap().total_margin, d("0.00"));

        let state = initialized_state(&[("home", "1.90"), ("away", "1.90")]);
        // implied 0.5263 * 2 = 1.0526 -> ~5.26%
        let margin = state.snapshot().unwrap().total_margin;
        assert!(margin > d("5.20") && margin < d("5.35"), "margin {margin}");
    }

    #[test]
    fn update_rejects_non_positive_and_suspended() {
        let mut state = initialized_state(&[("home", "2.00")]);
        let err = state.update(&update_request(&[("home", "0.00")])).unwrap_err();
        assert!(matches!(err, OddsError::InvalidOdds(_)));

        state.suspend("maintenance").unwrap();
        let err = state.update(&update_request(&[("home", "2.10")])).unwrap_err();
        assert!(matches!(err, OddsError::MarketSuspended { .. }));
    }

    #[test]
    fn update_appends_history_and_skips_unchanged() {
        let mut state = initialized_state(&[("home", "2.00"), ("away", "1.80")]);
        state.update(&update_request(&[("home", "1.90"), ("away", "1.80")])).unwrap();

        assert_eq!(state.histories.get("home").unwrap().updates().len(), 1);
        assert_eq!(state.histories.get("away").unwrap().updates().len(), 0);

        let events = state.take_events();
        let updated = events
            .iter()
            .find_map(|e| match e {
                EventPayload::OddsUpdated { changes, .. } => Some(changes),
                _ => None,
            })
            .unwrap();
        assert!(updated.contains_key("home"));
        assert!(!updated.contains_key("away"));
    }

    #[test]
    fn volatility_score_weights_frequency() {
        let mut history = OddsHistory::default();
        let now = Utc::now();
        // two 5% moves inside the window: (5 + 5) * (2 / 1h) = 20
        for (prev, new) in [("2.00", "1.90"), ("1.90", "1.995")] {
            history.push(OddsUpdate {
                previous: d(prev),
                new: d(new),
                source: "t".into(),
                reason: None,
                updated_at: now,
            });
        }
        let score = history.volatility_score(1.0, now);
        assert!((score - 20.0).abs() < 0.2, "score {score}");

        // outside the window the score collapses to zero
        let later = now + Duration::hours(2);
        assert_eq!(history.volatility_score(1.0, later), 0.0);
    }

    #[test]
    fn extreme_volatility_auto_suspends_in_the_same_operation() {
        let mut state = initialized_state(&[("home", "2.00")]);
        // 50% single move: score = 50 * (1/1) = 50 -> Extreme
        let snapshot = state.update(&update_request(&[("home", "1.00")])).unwrap();
        assert!(snapshot.is_suspended);
        assert_eq!(snapshot.suspension_reason.as_deref(), Some(AUTO_SUSPEND_REASON));
        assert_eq!(snapshot.volatility, VolatilityLevel::Extreme);

        let events = state.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EventPayload::OddsSuspended { automatic: true, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EventPayload::OddsVolatilityChanged { .. })));
    }

    #[test]
    fn suspend_and_resume_are_idempotent() {
        let mut state = initialized_state(&[("home", "2.00")]);
        state.suspend("manual").unwrap();
        state.take_events();

        let snapshot = state.suspend("again").unwrap();
        assert!(snapshot.is_suspended);
        assert_eq!(snapshot.suspension_reason.as_deref(), Some("manual"));
        assert!(state.take_events().is_empty());

        state.resume("back").unwrap();
        assert!(!state.take_events().is_empty());
        state.resume("back again").unwrap();
        assert!(state.take_events().is_empty());
    }

    #[test]
    fn locks_are_sets_per_selection() {
        let mut state = initialized_state(&[("home", "2.00"), ("away", "1.80")]);
        state.lock_for_bet("b1", "home").unwrap();
        state.lock_for_bet("b2", "home").unwrap();
        state.lock_for_bet("b2", "home").unwrap(); // set semantics

        assert_eq!(state.locks_for("home").unwrap().len(), 2);

        assert!(matches!(
            state.lock_for_bet("b3", "draw"),
            Err(OddsError::UnknownSelection { .. })
        ));

        state.suspend("pause").unwrap();
        assert!(matches!(
            state.lock_for_bet("b4", "home"),
            Err(OddsError::MarketSuspended { .. })
        ));

        state.unlock("b2").unwrap();
        assert_eq!(state.locks_for("home").unwrap().len(), 1);
        state.unlock("b1").unwrap();
        assert!(state.locks_for("home").is_none());
    }

    #[test]
    fn locking_does_not_freeze_updates() {
        let mut state = initialized_state(&[("home", "2.00")]);
        let locked = state.lock_for_bet("b1", "home").unwrap();
        assert_eq!(locked.decimal, d("2.00"));

        state.update(&update_request(&[("home", "1.90")])).unwrap();
        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.selections.get("home").unwrap().decimal, d("1.90"));
        // the lock still records b1 against the selection
        assert!(state.locks_for("home").unwrap().contains("b1"));
    }

    proptest! {
        // fractional and american conversions round-trip within a cent
        #[test]
        fn conversions_round_trip(cents in 101i64..2100) {
            let decimal = Decimal::new(cents, 2);
            let odds = Odds::new(decimal, "m", "s", "t").unwrap();

            let back = Odds::decimal_from_fractional(odds.to_fractional());
            prop_assert!((back - decimal).abs() <= d("0.01"), "fractional: {back} vs {decimal}");

            let american = odds.to_american().unwrap();
            let back = Odds::decimal_from_american(american).unwrap();
            prop_assert!((back - decimal).abs() <= d("0.01"), "american: {back} vs {decimal}");
        }

        #[test]
        fn implied_probability_is_inverse(cents in 101i64..5000) {
            let decimal = Decimal::new(cents, 2);
            let odds = Odds::new(decimal, "m", "s", "t").unwrap();
            let p = odds.implied_probability();
            prop_assert!(p > Decimal::ZERO && p < Decimal::ONE);
        }
    }
}
