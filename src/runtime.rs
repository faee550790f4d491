//! Entity runtime: addressable identity, on-demand activation and
//! single-threaded dispatch per `(kind, key)` address.
//!
//! Each active entity owns a mailbox drained by one task, so operations on
//! one address never run concurrently; distinct addresses run independently.
//! Entities suspend only on calls to other entities, storage I/O and broker
//! I/O. State is written through to the [`StateStore`] after every mutating
//! command; a node that loses an entity reactivates it elsewhere from the
//! persisted snapshot.

use crate::broker::{BrokerMessage, EventPublisher, InMemoryBroker};
use crate::config::Config;
use crate::event_log::{EventLog, InMemoryEventLog, RecordedEvent};
use crate::events::{DomainEvent, EventPayload};
use crate::store::{InMemoryStateStore, StateStore};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

const MAILBOX_CAPACITY: usize = 256;
const DISPATCH_RETRY_LIMIT: u32 = 3;
const PUBLISH_RETRY_LIMIT: u32 = 5;
const PUBLISH_BASE_DELAY_MS: u64 = 10;

tokio::task_local! {
    static CORRELATION_ID: Uuid;
}

/// Correlation id of the call currently being handled, if any. Client calls
/// pick this up automatically so the id flows through outbound calls.
pub fn current_correlation_id() -> Option<Uuid> {
    CORRELATION_ID.try_with(|id| *id).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Wallet,
    Odds,
    Bet,
    BetIndex,
    MarketIndex,
    SportEvent,
    SettlementSaga,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Wallet => "wallet",
            EntityKind::Odds => "odds",
            EntityKind::Bet => "bet",
            EntityKind::BetIndex => "bet-index",
            EntityKind::MarketIndex => "market-index",
            EntityKind::SportEvent => "sport-event",
            EntityKind::SettlementSaga => "settlement-saga",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityAddr {
    pub kind: EntityKind,
    pub key: String,
}

impl EntityAddr {
    pub fn new(kind: EntityKind, key: &str) -> Self {
        Self { kind, key: key.to_string() }
    }

    /// Aggregate id used for the entity's own event stream.
    pub fn aggregate_id(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.key)
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("call to {kind}/{key} timed out")]
    Timeout { kind: &'static str, key: String },
    #[error("mailbox for {kind}/{key} is closed")]
    MailboxClosed { kind: &'static str, key: String },
    #[error("entity {kind}/{key} dropped the reply")]
    ReplyDropped { kind: &'static str, key: String },
    #[error("call rejected: {reason}")]
    Rejected { reason: String },
    #[error("state store failure: {0}")]
    Store(String),
    #[error("state codec failure: {0}")]
    Codec(String),
}

impl RuntimeError {
    /// Transient faults may be retried (the settlement saga does, within its
    /// attempt budget). Codec failures are fatal and must not be retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RuntimeError::Codec(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationReason {
    Idle,
    RuntimeShutdown,
    Faulted,
}

/// Implemented by every command enum so filters and logs can name the method.
pub trait EntityCommand {
    fn method(&self) -> &'static str;
}

/// An addressable, single-threaded, stateful actor.
#[async_trait]
pub trait Entity: Sized + Send + Sync + 'static {
    const KIND: EntityKind;
    type Command: EntityCommand + Send + 'static;

    /// Build the entity from its key and an optional persisted snapshot.
    fn activate(key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError>;

    /// Serialize the entity's state for the store.
    fn snapshot(&self) -> Result<Vec<u8>, RuntimeError>;

    async fn on_activate(&mut self, _ctx: &EntityContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Process one command. Returns true when state changed and must be
    /// persisted before the next command is taken.
    async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool;

    fn on_deactivate(&mut self, _reason: DeactivationReason) {}
}

pub fn encode_state<T: Serialize>(state: &T) -> Result<Vec<u8>, RuntimeError> {
    serde_json::to_vec(state).map_err(|e| RuntimeError::Codec(e.to_string()))
}

pub fn decode_state<T: DeserializeOwned>(blob: &[u8]) -> Result<T, RuntimeError> {
    serde_json::from_slice(blob).map_err(|e| RuntimeError::Codec(e.to_string()))
}

pub struct Envelope<E: Entity> {
    command: E::Command,
    correlation_id: Uuid,
}

// ---------------------------------------------------------------------------
// Call filters
// ---------------------------------------------------------------------------

/// Interposed around every entity call made through an [`EntityRef`].
/// `before` may reject the call; `after` observes transport-level outcome and
/// latency (queueing included).
pub trait CallFilter: Send + Sync {
    fn before(
        &self,
        _kind: EntityKind,
        _key: &str,
        _method: &'static str,
        _correlation_id: Uuid,
    ) -> Result<(), String> {
        Ok(())
    }

    fn after(
        &self,
        _kind: EntityKind,
        _key: &str,
        _method: &'static str,
        _correlation_id: Uuid,
        _elapsed: Duration,
        _error: Option<&RuntimeError>,
    ) {
    }
}

const LATENCY_BUCKETS_MS: [u64; 7] = [1, 5, 10, 50, 100, 500, 1000];

#[derive(Default)]
struct MethodMetrics {
    calls: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicI64,
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

/// Per-(kind, method) call counters, latency histogram and in-flight gauge,
/// surfaced as JSON by the metrics endpoint.
#[derive(Default)]
pub struct MetricsFilter {
    methods: DashMap<(EntityKind, &'static str), Arc<MethodMetrics>>,
}

impl MetricsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn metrics(&self, kind: EntityKind, method: &'static str) -> Arc<MethodMetrics> {
        self.methods.entry((kind, method)).or_default().clone()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let mut entries: Vec<serde_json::Value> = Vec::new();
        for item in self.methods.iter() {
            let (kind, method) = *item.key();
            let m = item.value();
            let mut histogram = serde_json::Map::new();
            for (i, le) in LATENCY_BUCKETS_MS.iter().enumerate() {
                histogram.insert(
                    format!("le_{le}ms"),
                    serde_json::json!(m.buckets[i].load(Ordering::Relaxed)),
                );
            }
            histogram.insert(
                "gt_1000ms".to_string(),
                serde_json::json!(
                    m.buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed)
                ),
            );
            entries.push(serde_json::json!({
                "entity": kind.as_str(),
                "method": method,
                "calls": m.calls.load(Ordering::Relaxed),
                "failures": m.failures.load(Ordering::Relaxed),
                "inFlight": m.in_flight.load(Ordering::Relaxed),
                "latency": histogram,
            }));
        }
        entries.sort_by_key(|v| {
            (v["entity"].as_str().unwrap_or("").to_string(), v["method"].as_str().unwrap_or("").to_string())
        });
        serde_json::json!({ "methods": entries })
    }
}

impl CallFilter for MetricsFilter {
    fn before(
        &self,
        kind: EntityKind,
        _key: &str,
        method: &'static str,
        _correlation_id: Uuid,
    ) -> Result<(), String> {
        let m = self.metrics(kind, method);
        m.calls.fetch_add(1, Ordering::Relaxed);
        m.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn after(
        &self,
        kind: EntityKind,
        _key: &str,
        method: &'static str,
        _correlation_id: Uuid,
        elapsed: Duration,
        error: Option<&RuntimeError>,
    ) {
        let m = self.metrics(kind, method);
        m.in_flight.fetch_sub(1, Ordering::Relaxed);
        if error.is_some() {
            m.failures.fetch_add(1, Ordering::Relaxed);
        }
        let ms = elapsed.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|le| ms <= *le)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        m.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }
}

/// Structured logging around every call, correlation id included.
#[derive(Default)]
pub struct LoggingFilter;

impl CallFilter for LoggingFilter {
    fn before(
        &self,
        kind: EntityKind,
        key: &str,
        method: &'static str,
        correlation_id: Uuid,
    ) -> Result<(), String> {
        debug!(entity = kind.as_str(), key, method, correlation_id = %correlation_id, "entity call");
        Ok(())
    }

    fn after(
        &self,
        kind: EntityKind,
        key: &str,
        method: &'static str,
        correlation_id: Uuid,
        elapsed: Duration,
        error: Option<&RuntimeError>,
    ) {
        match error {
            None => debug!(
                entity = kind.as_str(),
                key,
                method,
                correlation_id = %correlation_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "entity call completed"
            ),
            Some(e) => warn!(
                entity = kind.as_str(),
                key,
                method,
                correlation_id = %correlation_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "entity call failed"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: Config,
    store: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    forwarder_tx: mpsc::UnboundedSender<DomainEvent>,
    filters: Vec<Arc<dyn CallFilter>>,
    registry: DashMap<EntityAddr, Box<dyn Any + Send + Sync>>,
    activation_locks: DashMap<EntityAddr, Arc<Mutex<()>>>,
    idle_after: Duration,
    call_timeout: Duration,
}

pub struct RuntimeBuilder {
    config: Config,
    store: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    publisher: Arc<dyn EventPublisher>,
    filters: Vec<Arc<dyn CallFilter>>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: Arc::new(InMemoryStateStore::new()),
            event_log: Arc::new(InMemoryEventLog::new()),
            publisher: Arc::new(InMemoryBroker::default()),
            filters: Vec::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn CallFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Spawns the event forwarder; call from within a tokio runtime.
    pub fn build(self) -> Runtime {
        let (forwarder_tx, forwarder_rx) = mpsc::unbounded_channel();
        let prefix = self.config.runtime.topic_prefix.clone();
        tokio::spawn(forward_events(forwarder_rx, self.publisher, prefix));

        let idle_after = Duration::from_secs(self.config.runtime.idle_deactivation_secs);
        let call_timeout = Duration::from_secs(self.config.runtime.call_timeout_secs);
        Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                store: self.store,
                event_log: self.event_log,
                forwarder_tx,
                filters: self.filters,
                registry: DashMap::new(),
                activation_locks: DashMap::new(),
                idle_after,
                call_timeout,
            }),
        }
    }
}

/// At-least-once, per-aggregate-ordered publish of appended events.
async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<DomainEvent>,
    publisher: Arc<dyn EventPublisher>,
    prefix: String,
) {
    while let Some(event) = rx.recv().await {
        let message = BrokerMessage::from_event(event, &prefix);
        let mut attempt = 0u32;
        loop {
            match publisher.publish(message.clone()).await {
                Ok(()) => break,
                Err(e) if attempt < PUBLISH_RETRY_LIMIT => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..10);
                    let delay = PUBLISH_BASE_DELAY_MS * (1 << (attempt - 1)) + jitter;
                    warn!(topic = %message.topic, attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    error!(topic = %message.topic, event_id = %message.event_id, error = %e,
                        "publish failed after retries; event remains in the log");
                    break;
                }
            }
        }
    }
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Fully in-memory runtime for tests.
    pub fn in_memory(config: Config) -> Runtime {
        RuntimeBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.inner.event_log
    }

    pub fn entity_ref<E: Entity>(&self, key: &str) -> EntityRef<E> {
        EntityRef {
            runtime: self.clone(),
            addr: EntityAddr::new(E::KIND, key),
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of currently registered (active) entities.
    pub fn active_entities(&self) -> usize {
        self.inner.registry.len()
    }

    fn sender_for<E: Entity>(&self, addr: &EntityAddr) -> mpsc::Sender<Envelope<E>> {
        use dashmap::mapref::entry::Entry;
        loop {
            if let Some(slot) = self.inner.registry.get(addr) {
                if let Some(tx) = slot.value().downcast_ref::<mpsc::Sender<Envelope<E>>>() {
                    if !tx.is_closed() {
                        return tx.clone();
                    }
                }
                drop(slot);
                self.inner.registry.remove_if(addr, |_, s| sender_closed::<E>(s));
                continue;
            }
            match self.inner.registry.entry(addr.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
                    vacant.insert(Box::new(tx.clone()));
                    tokio::spawn(run_entity::<E>(self.clone(), addr.clone(), rx));
                    return tx;
                }
            }
        }
    }

    async fn dispatch<E: Entity>(
        &self,
        addr: &EntityAddr,
        envelope: Envelope<E>,
    ) -> Result<(), RuntimeError> {
        let mut envelope = Some(envelope);
        for _ in 0..DISPATCH_RETRY_LIMIT {
            let tx = self.sender_for::<E>(addr);
            match tx.send(envelope.take().expect("envelope consumed twice")).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(env)) => {
                    // the entity deactivated between lookup and send
                    envelope = Some(env);
                    self.inner.registry.remove_if(addr, |_, s| sender_closed::<E>(s));
                }
            }
        }
        Err(RuntimeError::MailboxClosed { kind: E::KIND.as_str(), key: addr.key.clone() })
    }
}

fn sender_closed<E: Entity>(slot: &Box<dyn Any + Send + Sync>) -> bool {
    slot.downcast_ref::<mpsc::Sender<Envelope<E>>>().map_or(true, |tx| tx.is_closed())
}

// ---------------------------------------------------------------------------
// Typed reference
// ---------------------------------------------------------------------------

pub struct EntityRef<E: Entity> {
    runtime: Runtime,
    addr: EntityAddr,
    _marker: std::marker::PhantomData<fn(E)>,
}

impl<E: Entity> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            addr: self.addr.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E: Entity> EntityRef<E> {
    pub fn key(&self) -> &str {
        &self.addr.key
    }

    /// Send one command and await its reply. The closure receives the reply
    /// channel so command construction stays with the entity module.
    pub async fn call<R, F>(&self, make: F) -> Result<R, RuntimeError>
    where
        R: Send + 'static,
        F: FnOnce(oneshot::Sender<R>) -> E::Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = make(reply_tx);
        let method = command.method();
        let correlation_id = current_correlation_id().unwrap_or_else(Uuid::new_v4);
        let filters = &self.runtime.inner.filters;

        let started = Instant::now();
        let mut before_ran = 0usize;
        let mut rejection: Option<RuntimeError> = None;
        for filter in filters.iter() {
            if let Err(reason) = filter.before(E::KIND, &self.addr.key, method, correlation_id) {
                rejection = Some(RuntimeError::Rejected { reason });
                break;
            }
            before_ran += 1;
        }

        let result: Result<R, RuntimeError> = match rejection {
            Some(e) => Err(e),
            None => {
                let envelope = Envelope { command, correlation_id };
                match self.runtime.dispatch::<E>(&self.addr, envelope).await {
                    Err(e) => Err(e),
                    Ok(()) => {
                        match tokio::time::timeout(self.runtime.inner.call_timeout, reply_rx).await
                        {
                            Err(_) => Err(RuntimeError::Timeout {
                                kind: E::KIND.as_str(),
                                key: self.addr.key.clone(),
                            }),
                            Ok(Err(_)) => Err(RuntimeError::ReplyDropped {
                                kind: E::KIND.as_str(),
                                key: self.addr.key.clone(),
                            }),
                            Ok(Ok(value)) => Ok(value),
                        }
                    }
                }
            }
        };

        // `after` runs on exactly the filters whose `before` ran
        let elapsed = started.elapsed();
        for filter in filters.iter().take(before_ran) {
            filter.after(E::KIND, &self.addr.key, method, correlation_id, elapsed, result.as_ref().err());
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Entity context
// ---------------------------------------------------------------------------

/// Capabilities available to an entity while it handles a command.
pub struct EntityContext {
    runtime: Runtime,
    addr: EntityAddr,
    correlation_id: Uuid,
}

impl EntityContext {
    fn new(runtime: &Runtime, addr: &EntityAddr, correlation_id: Uuid) -> Self {
        Self { runtime: runtime.clone(), addr: addr.clone(), correlation_id }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &Config {
        self.runtime.config()
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn aggregate_id(&self) -> String {
        self.addr.aggregate_id()
    }

    /// Append one event to this entity's stream and queue it for publishing.
    pub async fn record_event(&self, payload: EventPayload) -> Result<(), RuntimeError> {
        self.record_events(vec![payload]).await
    }

    /// Append a batch atomically, then queue each for publishing in order.
    pub async fn record_events(&self, payloads: Vec<EventPayload>) -> Result<(), RuntimeError> {
        let aggregate_id = self.aggregate_id();
        let events: Vec<DomainEvent> =
            payloads.into_iter().map(|p| DomainEvent::new(&aggregate_id, p)).collect();
        self.runtime
            .inner
            .event_log
            .append_many(&aggregate_id, events.clone())
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        for event in events {
            // forwarder shutdown only happens at process exit
            let _ = self.runtime.inner.forwarder_tx.send(event);
        }
        Ok(())
    }

    /// Read this entity's own event stream (used for history reconstruction).
    pub async fn read_own_stream(&self) -> Result<Vec<RecordedEvent>, RuntimeError> {
        self.runtime
            .inner
            .event_log
            .read(&self.aggregate_id(), 0)
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn persist<E: Entity>(
    runtime: &Runtime,
    addr: &EntityAddr,
    entity: &E,
    expected_version: u64,
) -> Result<u64, RuntimeError> {
    let blob = entity.snapshot()?;
    runtime
        .inner
        .store
        .save(E::KIND, &addr.key, expected_version, blob)
        .await
        .map_err(|e| RuntimeError::Store(e.to_string()))
}

async fn run_entity<E: Entity>(
    runtime: Runtime,
    addr: EntityAddr,
    mut rx: mpsc::Receiver<Envelope<E>>,
) {
    // Serializes activation against a previous incarnation still passivating,
    // so a reactivation never reads a snapshot that is about to be overwritten.
    let lock = runtime
        .inner
        .activation_locks
        .entry(addr.clone())
        .or_insert_with(Default::default)
        .clone();
    let _guard = lock.lock_owned().await;

    let stored = match runtime.inner.store.load(E::KIND, &addr.key).await {
        Ok(s) => s,
        Err(e) => {
            error!(entity = %addr, error = %e, "failed to load entity state");
            runtime.inner.registry.remove(&addr);
            return;
        }
    };
    let mut version = stored.as_ref().map(|s| s.version).unwrap_or(0);
    let mut entity = match E::activate(&addr.key, stored.as_ref().map(|s| s.blob.as_slice())) {
        Ok(e) => e,
        Err(e) => {
            error!(entity = %addr, error = %e, "entity activation failed");
            runtime.inner.registry.remove(&addr);
            return;
        }
    };

    let lifecycle_ctx = EntityContext::new(&runtime, &addr, Uuid::new_v4());
    if let Err(e) = entity.on_activate(&lifecycle_ctx).await {
        error!(entity = %addr, error = %e, "on_activate failed");
        runtime.inner.registry.remove(&addr);
        return;
    }
    debug!(entity = %addr, version, "entity activated");

    let idle_after = runtime.inner.idle_after;
    let mut reason = loop {
        match tokio::time::timeout(idle_after, rx.recv()).await {
            Ok(Some(envelope)) => {
                match process_one(&runtime, &addr, &mut entity, envelope, version).await {
                    Ok(v) => version = v,
                    Err(()) => break DeactivationReason::Faulted,
                }
            }
            Ok(None) => break DeactivationReason::RuntimeShutdown,
            Err(_) => break DeactivationReason::Idle,
        }
    };

    // Unregister, then close the mailbox and drain what was accepted before
    // the close. Later sends fail and trigger a fresh activation, which waits
    // on the address lock until the final persist below lands.
    runtime.inner.registry.remove(&addr);
    rx.close();
    if reason != DeactivationReason::Faulted {
        while let Some(envelope) = rx.recv().await {
            match process_one(&runtime, &addr, &mut entity, envelope, version).await {
                Ok(v) => version = v,
                Err(()) => {
                    reason = DeactivationReason::Faulted;
                    break;
                }
            }
        }
    }

    entity.on_deactivate(reason);
    debug!(entity = %addr, ?reason, "entity deactivated");
}

/// Handle a single envelope and write state through on mutation.
/// Returns the (possibly advanced) version, or Err on a persistence fault.
async fn process_one<E: Entity>(
    runtime: &Runtime,
    addr: &EntityAddr,
    entity: &mut E,
    envelope: Envelope<E>,
    version: u64,
) -> Result<u64, ()> {
    let ctx = EntityContext::new(runtime, addr, envelope.correlation_id);
    let mutated = CORRELATION_ID
        .scope(envelope.correlation_id, entity.handle(envelope.command, &ctx))
        .await;
    if !mutated {
        return Ok(version);
    }
    match persist(runtime, addr, entity, version).await {
        Ok(v) => Ok(v),
        Err(e) => {
            error!(entity = %addr, error = %e, "state persistence failed; deactivating");
            Err(())
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct CounterState {
        value: u64,
        activations: u64,
    }

    struct CounterEntity {
        state: CounterState,
        last_correlation: Option<Uuid>,
    }

    enum CounterCommand {
        Add { n: u64, reply: oneshot::Sender<u64> },
        Get { reply: oneshot::Sender<u64> },
        Activations { reply: oneshot::Sender<u64> },
        LastCorrelation { reply: oneshot::Sender<Option<Uuid>> },
    }

    impl EntityCommand for CounterCommand {
        fn method(&self) -> &'static str {
            match self {
                CounterCommand::Add { .. } => "add",
                CounterCommand::Get { .. } => "get",
                CounterCommand::Activations { .. } => "activations",
                CounterCommand::LastCorrelation { .. } => "last_correlation",
            }
        }
    }

    #[async_trait]
    impl Entity for CounterEntity {
        const KIND: EntityKind = EntityKind::Wallet; // kind reuse is fine in tests
        type Command = CounterCommand;

        fn activate(_key: &str, snapshot: Option<&[u8]>) -> Result<Self, RuntimeError> {
            let mut state: CounterState = match snapshot {
                Some(blob) => decode_state(blob)?,
                None => CounterState { value: 0, activations: 0 },
            };
            state.activations += 1;
            Ok(Self { state, last_correlation: None })
        }

        fn snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
            encode_state(&self.state)
        }

        async fn handle(&mut self, command: Self::Command, ctx: &EntityContext) -> bool {
            self.last_correlation = Some(ctx.correlation_id());
            match command {
                CounterCommand::Add { n, reply } => {
                    self.state.value += n;
                    let _ = reply.send(self.state.value);
                    true
                }
                CounterCommand::Get { reply } => {
                    let _ = reply.send(self.state.value);
                    false
                }
                CounterCommand::Activations { reply } => {
                    let _ = reply.send(self.state.activations);
                    false
                }
                CounterCommand::LastCorrelation { reply } => {
                    let _ = reply.send(self.last_correlation);
                    false
                }
            }
        }
    }

    fn test_config(idle_secs: u64) -> Config {
        let mut config = Config::default();
        config.runtime.idle_deactivation_secs = idle_secs;
        config.runtime.call_timeout_secs = 5;
        config
    }

    #[tokio::test]
    async fn commands_on_one_address_are_serialized() {
        let runtime = Runtime::in_memory(test_config(60));
        let entity = runtime.entity_ref::<CounterEntity>("c1");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let entity = entity.clone();
            handles.push(tokio::spawn(async move {
                entity.call(|reply| CounterCommand::Add { n: 1, reply }).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let value = entity.call(|reply| CounterCommand::Get { reply }).await.unwrap();
        assert_eq!(value, 50);
    }

    #[tokio::test]
    async fn distinct_addresses_hold_distinct_state() {
        let runtime = Runtime::in_memory(test_config(60));
        let a = runtime.entity_ref::<CounterEntity>("a");
        let b = runtime.entity_ref::<CounterEntity>("b");
        a.call(|reply| CounterCommand::Add { n: 3, reply }).await.unwrap();
        b.call(|reply| CounterCommand::Add { n: 7, reply }).await.unwrap();
        assert_eq!(a.call(|reply| CounterCommand::Get { reply }).await.unwrap(), 3);
        assert_eq!(b.call(|reply| CounterCommand::Get { reply }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entities_deactivate_and_restore_from_snapshot() {
        let runtime = Runtime::in_memory(test_config(1));
        let entity = runtime.entity_ref::<CounterEntity>("idle");

        entity.call(|reply| CounterCommand::Add { n: 5, reply }).await.unwrap();
        assert_eq!(runtime.active_entities(), 1);

        // step past the idle deadline; the worker persists and unregisters
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(runtime.active_entities(), 0);

        // reactivation restores the persisted value
        let value = entity.call(|reply| CounterCommand::Get { reply }).await.unwrap();
        assert_eq!(value, 5);
        let activations =
            entity.call(|reply| CounterCommand::Activations { reply }).await.unwrap();
        assert_eq!(activations, 2);
    }

    #[tokio::test]
    async fn correlation_id_reaches_the_entity() {
        let runtime = Runtime::in_memory(test_config(60));
        let entity = runtime.entity_ref::<CounterEntity>("corr");

        let id = Uuid::new_v4();
        let seen = CORRELATION_ID
            .scope(id, async {
                entity
                    .call(|reply| CounterCommand::LastCorrelation { reply })
                    .await
                    .unwrap()
            })
            .await;
        assert_eq!(seen, Some(id));
    }

    #[tokio::test]
    async fn metrics_filter_counts_calls_and_failures() {
        let metrics = Arc::new(MetricsFilter::new());
        let faults = Arc::new(testing::FaultInjector::new());
        faults.fail(EntityKind::Wallet, "m1", "add");
        let runtime = Runtime::builder(test_config(60))
            .filter(metrics.clone())
            .filter(faults.clone())
            .build();
        let entity = runtime.entity_ref::<CounterEntity>("m1");

        let err = entity.call(|reply| CounterCommand::Add { n: 1, reply }).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected { .. }));

        faults.clear(EntityKind::Wallet, "m1", "add");
        entity.call(|reply| CounterCommand::Add { n: 1, reply }).await.unwrap();

        let snapshot = metrics.snapshot();
        let methods = snapshot["methods"].as_array().unwrap();
        let add = methods
            .iter()
            .find(|m| m["method"] == "add" && m["entity"] == "wallet")
            .unwrap();
        assert_eq!(add["calls"], 2);
        assert_eq!(add["failures"], 1);
        assert_eq!(add["inFlight"], 0);
    }

    #[tokio::test]
    async fn injected_faults_are_transient() {
        let faults = Arc::new(testing::FaultInjector::new());
        faults.fail(EntityKind::Wallet, "f1", "get");
        let runtime = Runtime::builder(test_config(60)).filter(faults.clone()).build();
        let entity = runtime.entity_ref::<CounterEntity>("f1");

        let err = entity.call(|reply| CounterCommand::Get { reply }).await.unwrap_err();
        assert!(err.is_transient());
    }
}
