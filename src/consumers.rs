//! Background broker consumers: bet-index maintenance, the settlement
//! trigger and the event-directory projection.
//!
//! Consumers deduplicate by event id, so at-least-once delivery and forwarder
//! retries never apply a reaction twice.

use crate::broker::{BrokerMessage, InMemoryBroker};
use crate::bet_index::{BetIndexClient, MarketIndexClient};
use crate::events::EventPayload;
use crate::market::EventStatus;
use crate::runtime::Runtime;
use crate::saga::{settlement_saga_id, SettlementRequest, SettlementSagaClient};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEDUP_WINDOW: usize = 4096;

/// Bounded set of recently seen event ids.
struct Dedup {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl Dedup {
    fn new() -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Returns false when the id was already observed.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Read-side projection backing `GET /api/events`.
#[derive(Clone, Default)]
pub struct EventDirectory {
    inner: Arc<DashMap<String, EventSummary>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub event_id: String,
    pub name: String,
    pub sport: String,
    pub start_time: DateTime<Utc>,
    pub status: EventStatus,
}

impl EventDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<EventSummary> {
        let mut events: Vec<EventSummary> =
            self.inner.iter().map(|e| e.value().clone()).collect();
        events.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        events
    }

    fn upsert(&self, summary: EventSummary) {
        self.inner.insert(summary.event_id.clone(), summary);
    }

    fn update_status(&self, event_id: &str, status: EventStatus) {
        if let Some(mut entry) = self.inner.get_mut(event_id) {
            entry.status = status;
        }
    }
}

/// Subscribe to the in-process broker and drive cross-entity reactions.
pub fn spawn_consumers(
    runtime: Runtime,
    broker: Arc<InMemoryBroker>,
    directory: EventDirectory,
) -> JoinHandle<()> {
    let mut rx = broker.subscribe();
    tokio::spawn(async move {
        let mut dedup = Dedup::new();
        loop {
            let message = match rx.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event consumer lagged behind the broker");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !dedup.insert(message.event_id) {
                debug!(event_id = %message.event_id, "duplicate event skipped");
                continue;
            }
            react(&runtime, &directory, message).await;
        }
    })
}

async fn react(runtime: &Runtime, directory: &EventDirectory, message: BrokerMessage) {
    match message.event.payload {
        EventPayload::BetAccepted { bet_id, user_id, market_id, selection_id, .. } => {
            if let Err(e) = BetIndexClient::new(runtime, &user_id).add_bet(&bet_id).await {
                warn!(bet_id, user_id, error = %e, "failed to index bet for user");
            }
            if let Err(e) =
                MarketIndexClient::new(runtime, &market_id).add_bet(&bet_id, &selection_id).await
            {
                warn!(bet_id, market_id, error = %e, "failed to index bet for market");
            }
        }
        EventPayload::MarketSettled { event_id, market_id, winning_selection } => {
            info!(market_id, winner = ?winning_selection, "market settled; starting settlement");
            let runtime = runtime.clone();
            // settlement can fan out across many bets; keep the consumer loop
            // responsive by running it on its own task
            tokio::spawn(async move {
                let saga_id = settlement_saga_id(&market_id);
                let request = SettlementRequest {
                    event_id,
                    market_id: market_id.clone(),
                    winning_selection_id: winning_selection,
                    bet_ids: None,
                };
                match SettlementSagaClient::new(&runtime, &saga_id).execute(request).await {
                    Ok(report) => {
                        info!(saga_id, status = ?report.status, "settlement finished")
                    }
                    Err(e) => warn!(saga_id, error = %e, "settlement saga failed to run"),
                }
            });
        }
        EventPayload::EventCreated { event_id, name, sport, start_time } => {
            directory.upsert(EventSummary {
                event_id,
                name,
                sport,
                start_time,
                status: EventStatus::Scheduled,
            });
        }
        EventPayload::EventStatusChanged { event_id, to, .. } => {
            directory.update_status(&event_id, to);
        }
        _ => {}
    }
}
