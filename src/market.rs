//! Sport-event entity: event and market lifecycle plus result recording,
//! keyed by event id. Recording a result emits `marketSettled`, which is the
//! settlement saga's trigger.

use crate::events::EventPayload;
use crate::runtime::{
    decode_state, encode_state, Entity, EntityCommand, EntityContext, EntityKind, EntityRef,
    Runtime, RuntimeError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::error;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum MarketError {
    #[error("event {0} does not exist")]
    EventNotFound(String),
    #[error("event {0} already exists")]
    EventAlreadyExists(String),
    #[error("event cannot move from {from:?} to {to:?}")]
    InvalidEventTransition { from: EventStatus, to: EventStatus },
    #[error("market cannot move from {from:?} to {to:?}")]
    InvalidMarketTransition { from: MarketStatus, to: MarketStatus },
    #[error("market {market_id} not found on event {event_id}")]
    MarketNotFound { event_id: String, market_id: String },
    #[error("market {0} already exists")]
    MarketAlreadyExists(String),
    #[error("market {0} is already settled")]
    AlreadySettled(String),
    #[error("outcome {outcome} is not part of market {market_id}")]
    UnknownOutcome { market_id: String, outcome: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventStatus {
    Scheduled,
    Live,
    Completed,
    Cancelled,
    Suspended,
}

impl EventStatus {
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Scheduled, Live)
                | (Scheduled, Cancelled)
                | (Scheduled, Suspended)
                | (Live, Completed)
                | (Live, Suspended)
                | (Suspended, Live)
                | (Suspended, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MarketStatus {
    Open,
    Active,
    Suspended,
    Closed,
    Settled,
}

impl MarketStatus {
    /// Mirrors the parent event's transition rules; `Settled` is reached
    /// through result recording only.
    pub fn can_transition_to(self, next: MarketStatus) -> bool {
        use MarketStatus::*;
        matches!(
            (self, next),
            (Open, Active)
                | (Open, Suspended)
                | (Open, Closed)
                | (Active, Closed)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Suspended, Closed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: String,
    pub event_id: String,
    pub name: String,
    pub description: String,
    pub status: MarketStatus,
    pub outcomes: HashMap<String, Decimal>,
    pub winning_outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SportEvent {
    pub id: String,
    pub name: String,
    pub sport: String,
    pub competition: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub markets: HashMap<String, Market>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub name: String,
    pub sport: String,
    pub competition: String,
    pub start_time: DateTime<Utc>,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMarketRequest {
    pub market_id: String,
    pub name: String,
    pub description: String,
    pub outcomes: HashMap<String, Decimal>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventEntityState {
    event_id: String,
    event: Option<SportEvent>,
    #[serde(skip)]
    pending_events: Vec<EventPayload>,
}

impl EventEntityState {
    fn new(event_id: &str) -> Self {
        Self { event_id: event_id.to_string(), event: None, pending_events: Vec::new() }
    }

    fn take_events(&mut self) -> Vec<EventPayload> {
        std::mem::take(&mut self.pending_events)
    }

    fn event_mut(&mut self) -> Result<&mut SportEvent, MarketError> {
        self.event.as_mut().ok_or_else(|| MarketError::EventNotFound(self.event_id.clone()))
    }

    fn event(&self) -> Result<&SportEvent, MarketError> {
        self.event.as_ref().ok_or_else(|| MarketError::EventNotFound(self.event_id.clone()))
    }

    fn create(&mut self, request: CreateEventRequest) -> Result<SportEvent, MarketError> {
        if self.event.is_some() {
            return Err(MarketError::EventAlreadyExists(self.event_id.clone()));
        }
        let now = Utc::now();
        let event = SportEvent {
            id: self.event_id.clone(),
            name: request.name,
            sport: request.sport,
            competition: request.competition,
            start_time: request.start_time,
            end_time: None,
            status: EventStatus::Scheduled,
            participants: request.participants,
            created_at: now,
            last_modified: now,
            markets: HashMap::new(),
        };
        self.pending_events.push(EventPayload::EventCreated {
            event_id: event.id.clone(),
            name: event.name.clone(),
            sport: event.sport.clone(),
            start_time: event.start_time,
        });
        self.event = Some(event.clone());
        Ok(event)
    }

    fn change_status(&mut self, to: EventStatus) -> Result<SportEvent, MarketError> {
        let event_id = self.event_id.clone();
        let event = self.event_mut()?;
        let from = event.status;
        if !from.can_transition_to(to) {
            return Err(MarketError::InvalidEventTransition { from, to });
        }
        event.status = to;
        event.last_modified = Utc::now();
        if to == EventStatus::Completed {
            event.end_time = Some(event.last_modified);
        }
        self.pending_events.push(EventPayload::EventStatusChanged { event_id, from, to });

        // cancelling an event voids every unsettled market
        if to == EventStatus::Cancelled {
            let open_markets: Vec<String> = self
                .event()?
                .markets
                .values()
                .filter(|m| m.status != MarketStatus::Settled)
                .map(|m| m.id.clone())
                .collect();
            for market_id in open_markets {
                self.void_market_inner(&market_id)?;
            }
        }
        Ok(self.event()?.clone())
    }

    fn add_market(&mut self, request: AddMarketRequest) -> Result<Market, MarketError> {
        let event_id = self.event_id.clone();
        let event = self.event_mut()?;
        if event.markets.contains_key(&request.market_id) {
            return Err(MarketError::MarketAlreadyExists(request.market_id));
        }
        let market = Market {
            id: request.market_id.clone(),
            event_id: event_id.clone(),
            name: request.name,
            description: request.description,
            status: MarketStatus::Open,
            outcomes: request.outcomes,
            winning_outcome: None,
        };
        event.markets.insert(market.id.clone(), market.clone());
        event.last_modified = Utc::now();
        self.pending_events.push(EventPayload::MarketAdded {
            event_id,
            market_id: market.id.clone(),
            name: market.name.clone(),
        });
        Ok(market)
    }

    fn market_mut(&mut self, market_id: &str) -> Result<&mut Market, MarketError> {
        let event_id = self.event_id.clone();
        self.event_mut()?.markets.get_mut(market_id).ok_or_else(|| {
            MarketError::MarketNotFound { event_id, market_id: market_id.to_string() }
        })
    }

    fn change_market_status(
        &mut self,
        market_id: &str,
        to: MarketStatus,
    ) -> Result<Market, MarketError> {
        let event_id = self.event_id.clone();
        let market = self.market_mut(market_id)?;
        let from = market.status;
        if !from.can_transition_to(to) {
            return Err(MarketError::InvalidMarketTransition { from, to });
        }
        market.status = to;
        let updated = market.clone();
        self.pending_events.push(EventPayload::MarketStatusChanged {
            event_id,
            market_id: market_id.to_string(),
            from,
            to,
        });
        self.event_mut()?.last_modified = Utc::now();
        Ok(updated)
    }

    /// Record the result; the emitted `marketSettled` drives settlement.
    fn set_market_result(
        &mut self,
        market_id: &str,
        winning_outcome: &str,
    ) -> Result<Market, MarketError> {
        let event_id = self.event_id.clone();
        let market = self.market_mut(market_id)?;
        if market.status == MarketStatus::Settled {
            return Err(MarketError::AlreadySettled(market_id.to_string()));
        }
        if !market.outcomes.contains_key(winning_outcome) {
            return Err(MarketError::UnknownOutcome {
                market_id: market_id.to_string(),
                outcome: winning_outcome.to_string(),
            });
        }
        let from = market.status;
        market.status = MarketStatus::Settled;
        market.winning_outcome = Some(winning_outcome.to_string());
        let settled = market.clone();
        self.pending_events.push(EventPayload::MarketStatusChanged {
            event_id: event_id.clone(),
            market_id: market_id.to_string(),
            from,
            to: MarketStatus::Settled,
        });
        self.pending_events.push(EventPayload::MarketSettled {
            event_id,
            market_id: market_id.to_string(),
            winning_selection: Some(winning_outcome.to_string()),
        });
        self.event_mut()?.last_modified = Utc::now();
        Ok(settled)
    }

    fn void_market_inner(&mut self, market_id: &str) -> Result<Market, MarketError> {
        let event_id = self.event_id.clone();
        let market = self.market_mut(market_id)?;
        if market.status == MarketStatus::Settled {
            return Err(MarketError::AlreadySettled(market_id.to_string()));
        }
        let from = market.status;
        market.status = MarketStatus::Settled;
        market.winning_outcome = None;
        let voided = market.clone();
        self.pending_events.push(EventPayload::MarketStatusChanged {
            event_id: event_id.clone(),
            market_id: market_id.to_string(),
            from,
            to: MarketStatus::Settled,
        });
        // a settled market without a winner reads as voided downstream
        self.pending_events.push(EventPayload::MarketSettled {
            event_id,
            market_id: market_id.to_string(),
            winning_selection: None,
        });
        Ok(voided)
    }

    fn void_market(&mut self, market_id: &str) -> Result<Market, MarketError> {
        let market = self.void_market_inner(market_id)?;
        self.event_mut()?.last_modified = Utc::now();
        Ok(market)
    }
}

// ---------------------------------------------------------------------------
// Entity plumbing
// ---------------------------------------------------------------------------

pub enum SportEventCommand {
    Create {
        request: CreateEventRequest,
        reply: oneshot::Sender<Result<SportEvent, MarketError>>,
    },
    Get {
        reply: oneshot::Sender<Result<SportEvent, MarketError>>,
    },
    ChangeStatus {
        to: EventStatus,
        reply: oneshot::Sender<Result<SportEvent, MarketError>>,
    },
    AddMarket {
        request: AddMarketRequest,
        reply: oneshot::Sender<Result<Market, MarketError>>,
    },
    ChangeMarketStatus {
        market_id: String,
        to: MarketStatus,
        reply: oneshot::Sender<Result<Market, MarketError>>,
    },
    SetMarketResult {
        market_id: String,
        winning_outcome: String,
        reply: oneshot::Sender<Result<Market, MarketError>>,
    },
    VoidMarket {
        market_id: String,
        reply: oneshot::Sender<Result<Market, MarketError>>,
    },
}

impl EntityCommand for SportEventCommand {
    fn method(&self) -> &'static str {
        match self {
            SportEventCommand::Create { .. } => "create_event",
            SportEventCommand::Get { .. } => "get_event",
            SportEventCommand::ChangeStatus { .. } => "change_event_status",
            SportEventCommand::AddMarket { .. } => "add_market",
            SportEventCommand::ChangeMarketStatus { .. } => "change_market_status",
            SportEventCommand::SetMarketResult { .. } => "set_market_result",
            SportEventCommand::VoidMarket { .. } => "void_market",
        }
    }
}

pub struct SportEventEntity {
    state: EventEntityState,
}

impl SportEventEntity {
    async fn flush_events(&mut self, ctx: &EntityContext) -> bool {
        let events = self.state.take_events();
        if events.is_empty() {
            return false;
        }
        if let Err(e) = ctx.record_events(events).await {
            error!(aggregate = %ctx.aggregate_id(), error = %e, "failed to append event-lifecycle events");
        }
        true
    }
}

#[async_trait]
impl Entity for SportEventEntity {
    const KIND: EntityKind = EntityKind::SportEvent;
    type Command = SportEventCommand;

    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
        let state = match snapshot {
            Some(blob) => decode_state(blob)?,
            None => EventEntityState::new(key),
        };
        Ok(Self { state })
    }

    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        encode_state(&self.state)
    }

    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
        match command {
            SportEventCommand::Create { request, reply } => {
                let result = self.state.create(request);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            SportEventCommand::Get { reply } => {
                let _ = reply.send(self.state.event().cloned());
                false
            }
            SportEventCommand::ChangeStatus { to, reply } => {
                let result = self.state.change_status(to);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            SportEventCommand::AddMarket { request, reply } => {
                let result = self.state.add_market(request);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            SportEventCommand::ChangeMarketStatus { market_id, to, reply } => {
                let result = self.state.change_market_status(&market_id, to);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            SportEventCommand::SetMarketResult { market_id, winning_outcome, reply } => {
                let result = self.state.set_market_result(&market_id, &winning_outcome);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
            SportEventCommand::VoidMarket { market_id, reply } => {
                let result = self.state.void_market(&market_id);
                let mutated = self.flush_events(ctx).await;
                let _ = reply.send(result);
                mutated
            }
        }
    }
}

/// Typed handle; the event id is the address.
#[derive(Clone)]
pub struct SportEventClient {
    entity: EntityRef<SportEventEntity>,
}

impl SportEventClient {
    pub fn new(runtime: &Runtime, event_id: &str) -> Self {
        Self { entity: runtime.entity_ref::<SportEventEntity>(event_id) }
    }

    pub async fn create(&self, request: CreateEventRequest) -> Result<SportEvent, MarketError> {
        self.entity.call(|reply| SportEventCommand::Create { request, reply }).await?
    }

    pub async fn get(&self) -> Result<SportEvent, MarketError> {
        self.entity.call(|reply| SportEventCommand::Get { reply }).await?
    }

    pub async fn change_status(&self, to: EventStatus) -> Result<SportEvent, MarketError> {
        self.entity.call(|reply| SportEventCommand::ChangeStatus { to, reply }).await?
    }

    pub async fn add_market(&self, request: AddMarketRequest) -> Result<Market, MarketError> {
        self.entity.call(|reply| SportEventCommand::AddMarket { request, reply }).await?
    }

    pub async fn change_market_status(
        &self,
        market_id: &str,
        to: MarketStatus,
    ) -> Result<Market, MarketError> {
        let market_id = market_id.to_string();
        self.entity
            .call(|reply| SportEventCommand::ChangeMarketStatus { market_id, to, reply })
            .await?
    }

    pub async fn set_market_result(
        &self,
        market_id: &str,
        winning_outcome: &str,
    ) -> Result<Market, MarketError> {
        let market_id = market_id.to_string();
        let winning_outcome = winning_outcome.to_string();
        self.entity
            .call(|reply| SportEventCommand::SetMarketResult { market_id, winning_outcome, reply })
            .await?
    }

    pub async fn void_market(&self, market_id: &str) -> Result<Market, MarketError> {
        let market_id = market_id.to_string();
        self.entity.call(|reply| SportEventCommand::VoidMarket { market_id, reply }).await?
    }
}
