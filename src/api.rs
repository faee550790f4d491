//! HTTP boundary: REST surface over the entities plus the WebSocket event
//! feed. Business failures arrive as typed results and are translated to
//! status codes here; responses always carry an `isSuccess` flag and a
//! human-readable `errorMessage` on failure.

use crate::bet::{BetClient, BetError, BetType, PlaceBetRequest};
use crate::bet_index::{BetIndexClient, BetIndexError};
use crate::broker::InMemoryBroker;
use crate::consumers::EventDirectory;
use crate::market::{
    AddMarketRequest, CreateEventRequest, EventStatus, MarketError, SportEventClient,
};
use crate::money::{Currency, Money, MoneyError};
use crate::odds::{OddsClient, OddsError, UpdateOddsRequest};
use crate::runtime::{MetricsFilter, Runtime, RuntimeError};
use crate::wallet::{WalletClient, WalletError};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{sink::SinkExt, stream::StreamExt};
use moka::future::Cache;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Runtime,
    pub broker: Arc<InMemoryBroker>,
    pub directory: EventDirectory,
    pub cache: Cache<String, String>,
    pub metrics: Arc<MetricsFilter>,
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "isSuccess": false,
            "errorMessage": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<MoneyError> for ApiError {
    fn from(e: MoneyError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        let status = match &e {
            WalletError::NonPositiveAmount
            | WalletError::InsufficientFunds { .. }
            | WalletError::Money(_) => StatusCode::BAD_REQUEST,
            WalletError::DuplicateReservation(_) | WalletError::NoSuchReservation(_) => {
                StatusCode::CONFLICT
            }
            WalletError::Runtime(_) | WalletError::InvariantViolation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<OddsError> for ApiError {
    fn from(e: OddsError) -> Self {
        let status = match &e {
            OddsError::NotInitialized(_) => StatusCode::NOT_FOUND,
            OddsError::AlreadyInitialized(_) | OddsError::MarketSuspended { .. } => {
                StatusCode::CONFLICT
            }
            OddsError::InvalidOdds(_) | OddsError::UnknownSelection { .. } => {
                StatusCode::BAD_REQUEST
            }
            OddsError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<BetError> for ApiError {
    fn from(e: BetError) -> Self {
        match e {
            BetError::Wallet(inner) => inner.into(),
            BetError::Odds(inner) => inner.into(),
            BetError::Money(inner) => inner.into(),
            BetError::Runtime(inner) => inner.into(),
            BetError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            BetError::AlreadyExists(_)
            | BetError::OddsChanged { .. }
            | BetError::MarketSuspended(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            BetError::InsufficientFunds
            | BetError::UnknownSelection(_)
            | BetError::InvalidState { .. }
            | BetError::NoSettlementToReverse { .. } => Self::bad_request(e.to_string()),
        }
    }
}

impl From<MarketError> for ApiError {
    fn from(e: MarketError) -> Self {
        let status = match &e {
            MarketError::EventNotFound(_) | MarketError::MarketNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            MarketError::EventAlreadyExists(_)
            | MarketError::MarketAlreadyExists(_)
            | MarketError::AlreadySettled(_) => StatusCode::CONFLICT,
            MarketError::InvalidEventTransition { .. }
            | MarketError::InvalidMarketTransition { .. }
            | MarketError::UnknownOutcome { .. } => StatusCode::BAD_REQUEST,
            MarketError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<BetIndexError> for ApiError {
    fn from(e: BetIndexError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn success(mut value: Value) -> (StatusCode, Json<Value>) {
    if let Some(object) = value.as_object_mut() {
        object.insert("isSuccess".to_string(), json!(true));
    }
    (StatusCode::OK, Json(value))
}

fn created(mut value: Value) -> (StatusCode, Json<Value>) {
    if let Some(object) = value.as_object_mut() {
        object.insert("isSuccess".to_string(), json!(true));
    }
    (StatusCode::CREATED, Json(value))
}

fn parse_money(amount: Decimal, currency: &str) -> Result<Money, ApiError> {
    let currency = Currency::parse(currency)?;
    Ok(Money::new(amount, currency)?)
}

/// Bet id derived from an idempotency key: the first 16 bytes of
/// `SHA-256(key)`, rendered as a UUID. Repeated posts with the same key land
/// on the same bet entity and replay the original placement.
fn bet_id_from_idempotency_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/runtime", get(runtime_metrics))
        .route("/ws", get(websocket_handler))
        // wallet
        .route("/api/wallet/:user_id/deposit", post(deposit))
        .route("/api/wallet/:user_id/withdraw", post(withdraw))
        .route("/api/wallet/:user_id/balance", get(balance))
        .route("/api/wallet/:user_id/transactions", get(transactions))
        .route("/api/wallet/:user_id/ledger", get(ledger))
        // bets
        .route("/api/bets", post(place_bet))
        .route("/api/bets/:bet_id", get(get_bet))
        .route("/api/bets/:bet_id/void", post(void_bet))
        .route("/api/bets/:bet_id/cashout", post(cash_out))
        .route("/api/bets/:bet_id/history", get(bet_history))
        .route("/api/users/:user_id/bets", get(user_bets))
        .route("/api/users/:user_id/bets/active", get(active_bets))
        // odds
        .route("/api/odds/:market_id", get(get_odds).put(update_odds))
        .route("/api/odds/:market_id/initialize", post(initialize_odds))
        .route("/api/odds/:market_id/suspend", post(suspend_odds))
        .route("/api/odds/:market_id/resume", post(resume_odds))
        .route("/api/odds/:market_id/lock", post(lock_odds))
        .route("/api/odds/:market_id/unlock", post(unlock_odds))
        // events and markets
        .route("/api/events", get(list_events).post(create_event))
        .route("/api/events/:event_id", get(get_event))
        .route("/api/events/:event_id/status", post(change_event_status))
        .route("/api/events/:event_id/markets", post(add_market))
        .route("/api/events/:event_id/markets/:market_id/result", post(set_market_result))
        .route("/api/events/:event_id/markets/:market_id/void", post(void_market))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "sportsbook-engine"
    }))
}

async fn runtime_metrics(State(state): State<ApiState>) -> Json<Value> {
    let mut snapshot = state.metrics.snapshot();
    if let Some(object) = snapshot.as_object_mut() {
        object.insert("activeEntities".to_string(), json!(state.runtime.active_entities()));
        object.insert("publishedEvents".to_string(), json!(state.broker.published_count()));
    }
    Json(snapshot)
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyMovementBody {
    amount: Decimal,
    currency: String,
    transaction_id: String,
}

async fn deposit(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(body): Json<MoneyMovementBody>,
) -> ApiResult {
    let amount = parse_money(body.amount, &body.currency)?;
    let receipt =
        WalletClient::new(&state.runtime, &user_id).deposit(amount, &body.transaction_id).await?;
    Ok(success(json!({
        "transaction": receipt.transaction,
        "newBalance": receipt.balance,
    })))
}

async fn withdraw(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(body): Json<MoneyMovementBody>,
) -> ApiResult {
    let amount = parse_money(body.amount, &body.currency)?;
    let receipt =
        WalletClient::new(&state.runtime, &user_id).withdraw(amount, &body.transaction_id).await?;
    Ok(success(json!({
        "transaction": receipt.transaction,
        "newBalance": receipt.balance,
    })))
}

async fn balance(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    let view = WalletClient::new(&state.runtime, &user_id).balance().await?;
    Ok(success(json!({
        "amount": view.balance.amount(),
        "currency": view.balance.currency(),
        "availableAmount": view.available.amount(),
        "reservedAmount": view.reserved.amount(),
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn transactions(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(50);
    let history =
        WalletClient::new(&state.runtime, &user_id).transaction_history(limit).await?;
    Ok(success(json!({ "transactions": history })))
}

async fn ledger(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(50);
    let entries = WalletClient::new(&state.runtime, &user_id).ledger_entries(limit).await?;
    Ok(success(json!({ "ledgerEntries": entries })))
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceBetBody {
    user_id: String,
    event_id: String,
    market_id: String,
    selection_id: String,
    stake: Decimal,
    currency: String,
    acceptable_odds: Decimal,
    idempotency_key: Option<String>,
    bet_type: Option<BetType>,
}

async fn place_bet(State(state): State<ApiState>, Json(body): Json<PlaceBetBody>) -> ApiResult {
    let amount = parse_money(body.stake, &body.currency)?;
    let bet_id = match &body.idempotency_key {
        Some(key) => bet_id_from_idempotency_key(key),
        None => Uuid::new_v4().to_string(),
    };
    let request = PlaceBetRequest {
        bet_id: bet_id.clone(),
        user_id: body.user_id,
        event_id: body.event_id,
        market_id: body.market_id,
        selection_id: body.selection_id,
        amount,
        acceptable_odds: body.acceptable_odds,
        bet_type: body.bet_type.unwrap_or(BetType::Single),
    };
    let bet = BetClient::new(&state.runtime, &bet_id).place(request).await?;
    state.cache.invalidate_all();
    Ok(created(json!({
        "betId": bet.id,
        "status": bet.status,
        "potentialPayout": bet.potential_payout(),
        "actualOdds": bet.odds,
    })))
}

async fn get_bet(State(state): State<ApiState>, Path(bet_id): Path<String>) -> ApiResult {
    let bet = BetClient::new(&state.runtime, &bet_id).get().await?;
    Ok(success(json!({ "bet": bet })))
}

#[derive(Deserialize)]
struct VoidBody {
    reason: String,
}

async fn void_bet(
    State(state): State<ApiState>,
    Path(bet_id): Path<String>,
    Json(body): Json<VoidBody>,
) -> ApiResult {
    let bet = BetClient::new(&state.runtime, &bet_id).void_bet(&body.reason).await?;
    state.cache.invalidate_all();
    Ok(success(json!({ "bet": bet })))
}

async fn cash_out(State(state): State<ApiState>, Path(bet_id): Path<String>) -> ApiResult {
    let result = BetClient::new(&state.runtime, &bet_id).cash_out().await?;
    state.cache.invalidate_all();
    Ok(success(json!({
        "payoutAmount": result.payout,
        "fees": result.fee,
        "cashedOutAt": result.cashed_out_at,
    })))
}

async fn bet_history(State(state): State<ApiState>, Path(bet_id): Path<String>) -> ApiResult {
    let history = BetClient::new(&state.runtime, &bet_id).history().await?;
    Ok(success(json!({ "history": history })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn user_bets(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let page = query.page.unwrap_or(0);
    let page_size = query.page_size.unwrap_or(20);
    let cache_key = format!("user-bets:{user_id}:{page}:{page_size}");

    if let Some(cached) = state.cache.get(&cache_key).await {
        if let Ok(value) = serde_json::from_str::<Value>(&cached) {
            debug!(user_id, page, "served user bets from cache");
            return Ok((StatusCode::OK, Json(value)));
        }
    }

    let listing =
        BetIndexClient::new(&state.runtime, &user_id).user_bets(page, page_size).await?;
    let (status, body) = success(json!({
        "bets": listing.bets,
        "totalCount": listing.total_count,
        "page": listing.page,
        "hasNextPage": listing.has_next_page,
    }));
    if let Ok(serialized) = serde_json::to_string(&body.0) {
        state.cache.insert(cache_key, serialized).await;
    }
    Ok((status, body))
}

async fn active_bets(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    let bets = BetIndexClient::new(&state.runtime, &user_id).active_bets().await?;
    Ok(success(json!({ "bets": bets })))
}

// ---------------------------------------------------------------------------
// Odds
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeOddsBody {
    initial_odds: HashMap<String, Decimal>,
    source: String,
}

async fn initialize_odds(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Json(body): Json<InitializeOddsBody>,
) -> ApiResult {
    let snapshot = OddsClient::new(&state.runtime, &market_id)
        .initialize_market(body.initial_odds, &body.source)
        .await?;
    Ok(created(json!({ "odds": snapshot })))
}

async fn get_odds(State(state): State<ApiState>, Path(market_id): Path<String>) -> ApiResult {
    let snapshot = OddsClient::new(&state.runtime, &market_id).current_odds().await?;
    Ok(success(json!({ "odds": snapshot })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateOddsBody {
    selection_odds: HashMap<String, Decimal>,
    source: String,
    reason: Option<String>,
    updated_by: Option<String>,
}

async fn update_odds(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Json(body): Json<UpdateOddsBody>,
) -> ApiResult {
    let request = UpdateOddsRequest {
        market_id: market_id.clone(),
        selection_odds: body.selection_odds,
        source: body.source,
        reason: body.reason,
        updated_by: body.updated_by,
    };
    let snapshot = OddsClient::new(&state.runtime, &market_id).update_odds(request).await?;
    Ok(success(json!({ "odds": snapshot })))
}

#[derive(Deserialize)]
struct ReasonBody {
    reason: Option<String>,
}

async fn suspend_odds(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> ApiResult {
    let reason = body.reason.unwrap_or_else(|| "manual suspension".to_string());
    let snapshot = OddsClient::new(&state.runtime, &market_id).suspend_odds(&reason).await?;
    Ok(success(json!({ "odds": snapshot })))
}

async fn resume_odds(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> ApiResult {
    let reason = body.reason.unwrap_or_else(|| "manual resume".to_string());
    let snapshot = OddsClient::new(&state.runtime, &market_id).resume_odds(&reason).await?;
    Ok(success(json!({ "odds": snapshot })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockBody {
    bet_id: String,
    selection_id: String,
}

async fn lock_odds(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Json(body): Json<LockBody>,
) -> ApiResult {
    let odds = OddsClient::new(&state.runtime, &market_id)
        .lock_odds_for_bet(&body.bet_id, &body.selection_id)
        .await?;
    Ok(success(json!({ "lockedOdds": odds })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnlockBody {
    bet_id: String,
}

async fn unlock_odds(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Json(body): Json<UnlockBody>,
) -> ApiResult {
    OddsClient::new(&state.runtime, &market_id).unlock_odds(&body.bet_id).await?;
    Ok(success(json!({})))
}

// ---------------------------------------------------------------------------
// Events and markets
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEventBody {
    event_id: String,
    name: String,
    sport: String,
    competition: String,
    start_time: DateTime<Utc>,
    participants: Option<Vec<String>>,
}

async fn create_event(
    State(state): State<ApiState>,
    Json(body): Json<CreateEventBody>,
) -> ApiResult {
    let request = CreateEventRequest {
        name: body.name,
        sport: body.sport,
        competition: body.competition,
        start_time: body.start_time,
        participants: body.participants.unwrap_or_default(),
    };
    let event = SportEventClient::new(&state.runtime, &body.event_id).create(request).await?;
    Ok(created(json!({ "event": event })))
}

async fn list_events(State(state): State<ApiState>) -> ApiResult {
    Ok(success(json!({ "events": state.directory.list() })))
}

async fn get_event(State(state): State<ApiState>, Path(event_id): Path<String>) -> ApiResult {
    let event = SportEventClient::new(&state.runtime, &event_id).get().await?;
    Ok(success(json!({ "event": event })))
}

#[derive(Deserialize)]
struct EventStatusBody {
    status: EventStatus,
}

async fn change_event_status(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
    Json(body): Json<EventStatusBody>,
) -> ApiResult {
    let event =
        SportEventClient::new(&state.runtime, &event_id).change_status(body.status).await?;
    Ok(success(json!({ "event": event })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMarketBody {
    market_id: String,
    name: String,
    description: Option<String>,
    outcomes: HashMap<String, Decimal>,
}

async fn add_market(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
    Json(body): Json<AddMarketBody>,
) -> ApiResult {
    let request = AddMarketRequest {
        market_id: body.market_id,
        name: body.name,
        description: body.description.unwrap_or_default(),
        outcomes: body.outcomes,
    };
    let market = SportEventClient::new(&state.runtime, &event_id).add_market(request).await?;
    Ok(created(json!({ "market": market })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketResultBody {
    winning_outcome: String,
}

async fn set_market_result(
    State(state): State<ApiState>,
    Path((event_id, market_id)): Path<(String, String)>,
    Json(body): Json<MarketResultBody>,
) -> ApiResult {
    let market = SportEventClient::new(&state.runtime, &event_id)
        .set_market_result(&market_id, &body.winning_outcome)
        .await?;
    state.cache.invalidate_all();
    Ok(success(json!({ "market": market })))
}

async fn void_market(
    State(state): State<ApiState>,
    Path((event_id, market_id)): Path<(String, String)>,
) -> ApiResult {
    let market =
        SportEventClient::new(&state.runtime, &event_id).void_market(&market_id).await?;
    state.cache.invalidate_all();
    Ok(success(json!({ "market": market })))
}

// ---------------------------------------------------------------------------
// WebSocket event feed
// ---------------------------------------------------------------------------

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> Response {
    ws.on_upgrade(move |socket| websocket_connection(socket, state))
}

/// Forward every published domain event to the connected client.
async fn websocket_connection(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.broker.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let frame = json!({
                        "topic": message.topic,
                        "eventId": message.event_id,
                        "aggregateId": message.partition_key,
                        "event": message.event,
                    });
                    if sender.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bet_ids_from_idempotency_keys_are_stable() {
        let a = bet_id_from_idempotency_key("order-123");
        let b = bet_id_from_idempotency_key("order-123");
        let c = bet_id_from_idempotency_key("order-124");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // canonical uuid text form
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn success_envelope_carries_the_flag() {
        let (status, body) = success(json!({ "value": 1 }));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["isSuccess"], true);
        assert_eq!(body.0["value"], 1);
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let conflict: ApiError =
            BetError::OddsChanged { current: Decimal::ONE, acceptable: Decimal::TWO }.into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let insufficient: ApiError = WalletError::InsufficientFunds {
            available: Decimal::ZERO,
            requested: Decimal::ONE,
        }
        .into();
        assert_eq!(insufficient.status, StatusCode::BAD_REQUEST);

        let nested: ApiError = BetError::Wallet(WalletError::InsufficientFunds {
            available: Decimal::ZERO,
            requested: Decimal::ONE,
        })
        .into();
        assert_eq!(nested.status, StatusCode::BAD_REQUEST);

        let missing: ApiError = OddsError::NotInitialized("m1".into()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }
}
