//! HTTP endpoint server using Axum

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, HmacTokenVerifier, TokenVerifier};
use crate::bridge::{BridgeConfig, BridgeError, BridgeOutcome, JobWaiters, SyncJobBridge};
use crate::cache::{MemoryTickCache, RedisTickCache, TickCache};
use crate::config;
use crate::jobs::propagation::{propagation_for, EntityUpdate};
use crate::metrics::Metrics;
use crate::models::{
    AccountInfo, AgentRecord, Job, JobResult, JobStatus, JobType, NewJob, OrderRequest,
    OrderResponse, SignalStatus, TvSignal, VersionStatus,
};
use crate::relay::PriceRelay;
use crate::sessions::{AgentSessions, SessionError};
use crate::store::{DataStore, EntityStore, JobStore, MemoryStore, PgStore, StoreError};
use crate::ws::{tick_event, PriceFanout, PriceStreamBridge};

/// How long a fetched candle response stays cached
const CANDLE_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<RwLock<HealthStatus>>,
    pub metrics: Arc<Metrics>,
    pub start_time: Arc<Instant>,
    pub store: Arc<dyn DataStore>,
    pub cache: Arc<dyn TickCache>,
    pub sessions: Arc<AgentSessions>,
    pub relay: Arc<PriceRelay>,
    pub fanout: Arc<PriceFanout>,
    pub waiters: Arc<JobWaiters>,
    pub bridge: Arc<SyncJobBridge>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub fn new<S: DataStore + 'static>(
        store: Arc<S>,
        cache: Arc<dyn TickCache>,
        verifier: Arc<dyn TokenVerifier>,
        bridge_config: BridgeConfig,
    ) -> Result<Self, prometheus::Error> {
        let metrics = Arc::new(Metrics::new()?);
        let waiters = Arc::new(JobWaiters::new());
        let sessions = Arc::new(AgentSessions::new(store.clone()));
        let relay = Arc::new(PriceRelay::new(cache.clone()));
        let fanout = Arc::new(PriceFanout::new());
        let bridge = Arc::new(SyncJobBridge::new(
            store.clone(),
            store.clone(),
            waiters.clone(),
            bridge_config,
        ));

        Ok(Self {
            health: Arc::new(RwLock::new(HealthStatus::default())),
            metrics,
            start_time: Arc::new(Instant::now()),
            store: store.clone(),
            cache,
            sessions,
            relay,
            fanout,
            waiters,
            bridge,
            verifier,
        })
    }
}

#[derive(Clone, Debug)]
pub struct HealthStatus {
    pub status: String,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, detail: &str) -> ApiError {
    (status, Json(json!({ "detail": detail })))
}

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let health = state.health.read().await;
    let uptime_seconds = state.start_time.elapsed().as_secs();
    Ok(Json(json!({
        "status": health.status,
        "uptime_seconds": uptime_seconds,
        "service": "fxbridge-api"
    })))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .export()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Middleware to track HTTP request metrics
async fn metrics_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    state.metrics.http_requests_in_flight.inc();

    let response = next.run(request).await;
    let status = response.status();
    let duration = start.elapsed();

    state.metrics.http_requests_in_flight.dec();
    state.metrics.http_requests_total.inc();
    state
        .metrics
        .http_request_duration_seconds
        .observe(duration.as_secs_f64());

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = %status,
            duration_ms = duration.as_millis(),
            "HTTP request error"
        );
    }

    response
}

/// Resolve the bearer token to a user, or 401
fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing_token"))?;

    state
        .verifier
        .verify(token)
        .map_err(|_| api_error(StatusCode::UNAUTHORIZED, "invalid_token"))
}

/// Authenticate the agent headers against the path agent id, or 401.
/// Nothing downstream runs on a failed check.
async fn require_agent(
    state: &AppState,
    headers: &HeaderMap,
    path_agent_id: Uuid,
) -> Result<AgentRecord, ApiError> {
    let key = headers
        .get("X-Agent-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing_agent_key"))?;

    if let Some(header_id) = headers.get("X-Agent-Id").and_then(|v| v.to_str().ok()) {
        match Uuid::parse_str(header_id) {
            Ok(id) if id == path_agent_id => {}
            _ => return Err(api_error(StatusCode::UNAUTHORIZED, "agent_id_mismatch")),
        }
    }

    match state.sessions.authenticate(path_agent_id, key).await {
        Ok(agent) => Ok(agent),
        Err(SessionError::Unauthorized) => {
            Err(api_error(StatusCode::UNAUTHORIZED, "invalid_agent_key"))
        }
        Err(e) => {
            error!(agent_id = %path_agent_id, error = %e, "Agent authentication failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Agent endpoints

#[derive(Debug, Serialize)]
struct PairAgentResponse {
    agent_id: Uuid,
    /// Shown exactly once; only a hash survives
    pairing_key: String,
}

async fn pair_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PairAgentResponse>, ApiError> {
    let user = require_user(&state, &headers)?;

    let paired = state.sessions.pair(user.id).await.map_err(|e| {
        error!(error = %e, "Failed to pair agent");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "pairing_failed")
    })?;

    info!(agent_id = %paired.agent_id, user_id = %user.id, "Agent paired");
    Ok(Json(PairAgentResponse {
        agent_id: paired.agent_id,
        pairing_key: paired.pairing_key,
    }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    status: String,
    #[serde(default)]
    metrics: Value,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<Value>, ApiError> {
    require_agent(&state, &headers, agent_id).await?;

    state
        .sessions
        .heartbeat(agent_id, &request.status, request.metrics)
        .await
        .map_err(|e| {
            error!(agent_id = %agent_id, error = %e, "Heartbeat update failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "heartbeat_failed")
        })?;

    Ok(Json(json!({ "acknowledged": true })))
}

async fn next_job(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent(&state, &headers, agent_id).await?;

    let claimed = state
        .store
        .claim_next(agent.user_id, agent.id)
        .await
        .map_err(|e| {
            error!(agent_id = %agent_id, error = %e, "Job claim failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "claim_failed")
        })?;

    match claimed {
        Some(job) => {
            state.metrics.jobs_claimed_total.inc();
            info!(agent_id = %agent_id, job_id = %job.id, job_type = job.job_type.as_str(), "Job claimed");
            Ok(Json(json!({
                "job_id": job.id,
                "job_type": job.job_type,
                "input_data": job.input_data,
            })))
        }
        // Empty queue is the normal answer for a polling agent
        None => Ok(Json(json!({ "no_jobs": true }))),
    }
}

#[derive(Debug, Deserialize)]
struct JobResultRequest {
    status: JobStatus,
    output_data: Option<Value>,
    error_message: Option<String>,
}

async fn submit_job_result(
    State(state): State<AppState>,
    Path((agent_id, job_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(request): Json<JobResultRequest>,
) -> Result<Json<Value>, ApiError> {
    require_agent(&state, &headers, agent_id).await?;

    if !request.status.is_terminal() {
        return Err(api_error(StatusCode::BAD_REQUEST, "non_terminal_status"));
    }

    let job = state
        .store
        .submit_result(
            job_id,
            JobResult {
                status: request.status,
                output_data: request.output_data,
                error_message: request.error_message,
            },
        )
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "job_not_found"),
            StoreError::InvalidTransition(_) => {
                api_error(StatusCode::CONFLICT, "invalid_transition")
            }
            e => {
                error!(job_id = %job_id, error = %e, "Result submission failed");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "result_failed")
            }
        })?;

    match job.status {
        JobStatus::Completed => state.metrics.jobs_completed_total.inc(),
        JobStatus::Failed => state.metrics.jobs_failed_total.inc(),
        _ => {}
    }

    apply_propagation(&state, &job).await;
    state.waiters.notify(&job).await;

    info!(job_id = %job.id, status = job.status.as_str(), "Job resolved");
    Ok(Json(json!({ "acknowledged": true })))
}

/// Propagate a terminal job result to its downstream entity.
///
/// The job itself stays resolved even if this write fails: the agent has
/// already acted on the real account, so the failure is logged for
/// reconciliation rather than rolled back.
async fn apply_propagation(state: &AppState, job: &Job) {
    let Some(update) = propagation_for(job) else {
        return;
    };
    if let Err(e) = state.store.apply_update(&update, Utc::now()).await {
        error!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            error = %e,
            "Entity propagation failed; job result kept"
        );
    }
}

#[derive(Debug, Deserialize)]
struct PriceQuote {
    bid: f64,
    ask: f64,
    time: Option<DateTime<Utc>>,
}

async fn update_prices(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
    headers: HeaderMap,
    Json(quotes): Json<HashMap<String, PriceQuote>>,
) -> Result<Json<Value>, ApiError> {
    require_agent(&state, &headers, agent_id).await?;

    let mut received = 0;
    for (instrument, quote) in quotes {
        let time = quote.time.unwrap_or_else(Utc::now);
        match state
            .relay
            .publish_tick(&instrument, quote.bid, quote.ask, time)
            .await
        {
            Ok(()) => {
                state.metrics.ticks_received_total.inc();
                received += 1;
            }
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Tick relay failed");
            }
        }
    }

    Ok(Json(json!({ "received": received })))
}

async fn agent_status(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_user(&state, &headers)?;

    let (agent, liveness) = state.sessions.status(agent_id).await.map_err(|e| match e {
        SessionError::NotFound => api_error(StatusCode::NOT_FOUND, "agent_not_found"),
        e => {
            error!(agent_id = %agent_id, error = %e, "Status lookup failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "status_failed")
        }
    })?;

    Ok(Json(json!({
        "agent_id": agent.id,
        "is_connected": agent.is_connected,
        "last_heartbeat": agent.last_heartbeat,
        "status": liveness.as_str(),
        "metrics": agent.metrics,
    })))
}

// ---------------------------------------------------------------------------
// Trading endpoints (Synchronous-Job Bridge)

fn map_bridge_error(e: BridgeError) -> ApiError {
    match e {
        BridgeError::AgentOffline => api_error(StatusCode::SERVICE_UNAVAILABLE, "agent_offline"),
        BridgeError::Store(e) => {
            error!(error = %e, "Bridge store error");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error")
        }
    }
}

async fn place_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OrderRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let user = require_user(&state, &headers)?;

    let input = json!({
        "symbol": request.symbol,
        "side": request.side,
        "volume": request.volume,
        "sl_pips": request.sl_pips,
        "tp_pips": request.tp_pips,
    });

    state.metrics.jobs_enqueued_total.inc();
    let outcome = state
        .bridge
        .run_job(user.id, JobType::Trade, input, state.bridge.write_deadline())
        .await
        .map_err(map_bridge_error)?;

    let response = match outcome {
        BridgeOutcome::Completed(job) => {
            let output = job.output_data.unwrap_or_default();
            OrderResponse {
                order_id: job.id.to_string(),
                fill_price: output.get("fill_price").and_then(Value::as_f64),
                status: "filled".to_string(),
                error_message: None,
            }
        }
        BridgeOutcome::Failed(job) => OrderResponse {
            order_id: job.id.to_string(),
            fill_price: None,
            status: "error".to_string(),
            error_message: job.error_message,
        },
        BridgeOutcome::TimedOut(job) => {
            state.metrics.bridge_timeouts_total.inc();
            OrderResponse {
                order_id: job.id.to_string(),
                fill_price: None,
                status: "pending".to_string(),
                error_message: None,
            }
        }
    };

    Ok(Json(response))
}

async fn get_positions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers)?;

    state.metrics.jobs_enqueued_total.inc();
    let outcome = state
        .bridge
        .run_job(
            user.id,
            JobType::GetPositions,
            json!({}),
            state.bridge.read_deadline(),
        )
        .await;

    // Reads are tolerant: an unreachable agent just means no data
    let positions = match outcome {
        Ok(BridgeOutcome::Completed(job)) => job
            .output_data
            .and_then(|o| o.get("positions").cloned())
            .unwrap_or_else(|| json!([])),
        Ok(BridgeOutcome::TimedOut(_)) => {
            state.metrics.bridge_timeouts_total.inc();
            json!([])
        }
        Ok(BridgeOutcome::Failed(_)) | Err(BridgeError::AgentOffline) => json!([]),
        Err(e) => return Err(map_bridge_error(e)),
    };

    Ok(Json(positions))
}

async fn close_position(
    State(state): State<AppState>,
    Path(ticket): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers)?;

    state.metrics.jobs_enqueued_total.inc();
    let outcome = state
        .bridge
        .run_job(
            user.id,
            JobType::ClosePosition,
            json!({ "ticket": ticket }),
            state.bridge.write_deadline(),
        )
        .await
        .map_err(map_bridge_error)?;

    match outcome {
        BridgeOutcome::Completed(job) => {
            let output = job.output_data.unwrap_or_default();
            Ok(Json(json!({
                "closed_price": output.get("closed_price").and_then(Value::as_f64),
                "pnl": output.get("pnl").and_then(Value::as_f64),
            })))
        }
        BridgeOutcome::Failed(job) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "detail": "close_failed",
                "error_message": job.error_message,
            })),
        )),
        BridgeOutcome::TimedOut(_) => {
            state.metrics.bridge_timeouts_total.inc();
            Err(api_error(StatusCode::GATEWAY_TIMEOUT, "close_timeout"))
        }
    }
}

async fn get_account(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AccountInfo>, ApiError> {
    let user = require_user(&state, &headers)?;

    state.metrics.jobs_enqueued_total.inc();
    let outcome = state
        .bridge
        .run_job(
            user.id,
            JobType::GetAccount,
            json!({}),
            state.bridge.read_deadline(),
        )
        .await
        .map_err(map_bridge_error)?;

    match outcome {
        BridgeOutcome::Completed(job) => {
            let output = job.output_data.unwrap_or_default();
            Ok(Json(AccountInfo {
                balance: output.get("balance").and_then(Value::as_f64).unwrap_or(0.0),
                equity: output.get("equity").and_then(Value::as_f64).unwrap_or(0.0),
                margin_used: output
                    .get("margin_used")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                margin_available: output
                    .get("margin_available")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                currency: output
                    .get("currency")
                    .and_then(Value::as_str)
                    .unwrap_or("USD")
                    .to_string(),
                leverage: output.get("leverage").and_then(Value::as_i64).unwrap_or(100),
            }))
        }
        BridgeOutcome::Failed(_) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "agent_error")),
        BridgeOutcome::TimedOut(_) => {
            state.metrics.bridge_timeouts_total.inc();
            Err(api_error(StatusCode::GATEWAY_TIMEOUT, "account_timeout"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CandleQuery {
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "default_candle_count")]
    count: i64,
}

fn default_timeframe() -> String {
    "H1".to_string()
}

fn default_candle_count() -> i64 {
    200
}

async fn get_candles(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
    Query(params): Query<CandleQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers)?;

    let cache_key = format!("candles:{}:{}", instrument, params.timeframe);
    match state.cache.get_json(&cache_key).await {
        Ok(Some(cached)) => return Ok(Json(cached)),
        Ok(None) => {}
        Err(e) => warn!(key = %cache_key, error = %e, "Candle cache read failed"),
    }

    state.metrics.jobs_enqueued_total.inc();
    let outcome = state
        .bridge
        .run_job(
            user.id,
            JobType::GetCandles,
            json!({
                "symbol": instrument,
                "timeframe": params.timeframe,
                "count": params.count,
            }),
            state.bridge.write_deadline(),
        )
        .await
        .map_err(map_bridge_error)?;

    match outcome {
        BridgeOutcome::Completed(job) => {
            let candles = job
                .output_data
                .and_then(|o| o.get("candles").cloned())
                .unwrap_or_else(|| json!([]));
            if let Err(e) = state
                .cache
                .set_json(&cache_key, &candles, CANDLE_CACHE_TTL)
                .await
            {
                warn!(key = %cache_key, error = %e, "Candle cache write failed");
            }
            Ok(Json(candles))
        }
        BridgeOutcome::Failed(_) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "agent_error")),
        BridgeOutcome::TimedOut(_) => {
            state.metrics.bridge_timeouts_total.inc();
            Err(api_error(StatusCode::GATEWAY_TIMEOUT, "candles_timeout"))
        }
    }
}

// ---------------------------------------------------------------------------
// TradingView webhook intake

/// Webhook receiver. Always answers `{"status": "ok"}` so the endpoint
/// cannot be probed for valid secrets.
async fn tv_webhook(
    State(state): State<AppState>,
    Path(webhook_secret): Path<String>,
    body: Bytes,
) -> Json<Value> {
    let ok = Json(json!({ "status": "ok" }));

    let strategy = match state.store.strategy_by_webhook_secret(&webhook_secret).await {
        Ok(Some(strategy)) => strategy,
        Ok(None) => return ok,
        Err(e) => {
            error!(error = %e, "Webhook strategy lookup failed");
            return ok;
        }
    };

    let payload: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    let symbol = payload.get("symbol").and_then(Value::as_str).map(str::to_string);
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .map(|a| a.to_lowercase());
    let volume = payload.get("volume").and_then(Value::as_f64);

    if !strategy.is_enabled {
        record_signal(&state, &strategy, None, None, None, SignalStatus::Discarded, None, json!({}))
            .await;
        return ok;
    }

    let Some(symbol) = symbol else {
        return ok;
    };

    // Risk gate: refuse new signals once today's realized loss crosses the
    // user's daily limit
    if let Err(reason) = daily_loss_gate(&state, strategy.user_id).await {
        record_signal(
            &state,
            &strategy,
            Some(symbol),
            action,
            volume,
            SignalStatus::Discarded,
            Some(reason),
            payload,
        )
        .await;
        return ok;
    }

    let signal_id = record_signal(
        &state,
        &strategy,
        Some(symbol.clone()),
        action.clone(),
        volume,
        SignalStatus::Pending,
        None,
        payload,
    )
    .await;

    let Some(signal_id) = signal_id else {
        return ok;
    };

    let enqueued = state
        .store
        .enqueue(NewJob {
            user_id: strategy.user_id,
            job_type: JobType::Trade,
            input_data: json!({
                "symbol": symbol,
                "side": action,
                "volume": volume,
                "source": "tv_signal",
                "signal_id": signal_id,
            }),
        })
        .await;

    match enqueued {
        Ok(job) => {
            state.metrics.jobs_enqueued_total.inc();
            info!(signal_id = %signal_id, job_id = %job.id, "Webhook signal queued for execution");
        }
        Err(e) => error!(signal_id = %signal_id, error = %e, "Webhook job enqueue failed"),
    }

    ok
}

/// Err(reason) when the user's realized loss today already exceeds their
/// daily limit
async fn daily_loss_gate(state: &AppState, user_id: Uuid) -> Result<(), String> {
    let settings = match state.store.user_settings(user_id).await {
        Ok(settings) => settings,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Risk settings lookup failed, allowing signal");
            return Ok(());
        }
    };

    if settings.cached_balance <= 0.0 {
        return Ok(());
    }

    let today_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(Utc::now);

    let pnl = match state.store.realized_pnl_since(user_id, today_start).await {
        Ok(pnl) => pnl,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "P&L lookup failed, allowing signal");
            return Ok(());
        }
    };

    let loss_percentage = pnl.abs() / settings.cached_balance * 100.0;
    if pnl < 0.0 && loss_percentage >= settings.daily_loss_limit_pct {
        return Err("daily_loss_limit_reached".to_string());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn record_signal(
    state: &AppState,
    strategy: &crate::models::TvStrategy,
    symbol: Option<String>,
    action: Option<String>,
    volume: Option<f64>,
    status: SignalStatus,
    error_message: Option<String>,
    raw_payload: Value,
) -> Option<Uuid> {
    let signal = TvSignal {
        id: Uuid::new_v4(),
        user_id: strategy.user_id,
        strategy_id: strategy.id,
        symbol,
        action,
        volume,
        status,
        fill_price: None,
        broker_order_id: None,
        error_message,
        raw_payload,
        created_at: Utc::now(),
        resolved_at: None,
    };
    let id = signal.id;
    match state.store.insert_signal(signal).await {
        Ok(()) => Some(id),
        Err(e) => {
            error!(error = %e, "Signal insert failed");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// EA job enqueue endpoints

async fn compile_version(
    State(state): State<AppState>,
    Path(version_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers)?;

    let version = state.store.get_version(version_id).await.map_err(|e| match e {
        StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "version_not_found"),
        e => {
            error!(version_id = %version_id, error = %e, "Version lookup failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error")
        }
    })?;
    if version.user_id != user.id {
        return Err(api_error(StatusCode::NOT_FOUND, "version_not_found"));
    }

    let job = state
        .store
        .enqueue(NewJob {
            user_id: user.id,
            job_type: JobType::Compile,
            input_data: json!({ "version_id": version_id }),
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Compile enqueue failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "enqueue_failed")
        })?;
    state.metrics.jobs_enqueued_total.inc();

    // Mark the version in flight; the job result flips it to compiled/failed
    if let Err(e) = state
        .store
        .apply_update(
            &EntityUpdate::Version {
                id: version_id,
                status: VersionStatus::Compiling,
            },
            Utc::now(),
        )
        .await
    {
        warn!(version_id = %version_id, error = %e, "Version status update failed");
    }

    Ok(Json(json!({ "job_id": job.id, "status": "queued" })))
}

async fn deployment_action(
    State(state): State<AppState>,
    Path((deployment_id, action)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers)?;

    let job_type = match action.as_str() {
        "deploy" => JobType::Deploy,
        "start" => JobType::Run,
        "stop" => JobType::Stop,
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "unknown_action")),
    };

    let deployment = state
        .store
        .get_deployment(deployment_id)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "deployment_not_found"),
            e => {
                error!(deployment_id = %deployment_id, error = %e, "Deployment lookup failed");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        })?;
    if deployment.user_id != user.id {
        return Err(api_error(StatusCode::NOT_FOUND, "deployment_not_found"));
    }

    let job = state
        .store
        .enqueue(NewJob {
            user_id: user.id,
            job_type,
            input_data: json!({
                "deployment_id": deployment_id,
                "version_id": deployment.version_id,
            }),
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Deployment job enqueue failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "enqueue_failed")
        })?;
    state.metrics.jobs_enqueued_total.inc();

    Ok(Json(json!({ "job_id": job.id, "status": "queued" })))
}

// ---------------------------------------------------------------------------
// WebSocket price streaming

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

async fn ws_prices(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Reject before upgrading; an unauthenticated socket never registers
    if state.verifier.verify(&params.token).is_err() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_price_socket(state, instrument, socket))
}

async fn handle_price_socket(state: AppState, instrument: String, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();

    // Snapshot first: late subscribers get the last cached tick immediately
    match state.relay.get_cached_tick(&instrument).await {
        Ok(Some(tick)) => {
            if sink
                .send(Message::Text(tick_event(&tick).into()))
                .await
                .is_err()
            {
                return;
            }
        }
        Ok(None) => {}
        Err(e) => warn!(instrument = %instrument, error = %e, "Cached tick read failed"),
    }

    let (socket_id, mut outbound) = state.fanout.register(&instrument).await;
    state.metrics.ws_clients_connected.inc();
    info!(instrument = %instrument, socket_id = socket_id, "Price socket connected");

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                        if sink.send(Message::Text("pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.fanout.deregister(&instrument, socket_id).await;
    state.metrics.ws_clients_connected.dec();
    info!(instrument = %instrument, socket_id = socket_id, "Price socket disconnected");
}

// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/agents/pair", post(pair_agent))
        .route("/agents/{id}/heartbeat", post(heartbeat))
        .route("/agents/{id}/jobs/next", get(next_job))
        .route("/agents/{id}/jobs/{job_id}/result", post(submit_job_result))
        .route("/agents/{id}/prices", post(update_prices))
        .route("/agents/{id}/status", get(agent_status))
        .route("/trading/orders", post(place_order))
        .route("/trading/positions", get(get_positions))
        .route("/trading/positions/{ticket}", delete(close_position))
        .route("/trading/account", get(get_account))
        .route("/trading/candles/{instrument}", get(get_candles))
        .route("/webhooks/tv/{secret}", post(tv_webhook))
        .route("/ea/versions/{id}/compile", post(compile_version))
        .route("/deployments/{id}/{action}", post(deployment_action))
        .route("/ws/prices/{instrument}", get(ws_prices))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Build production state, start the pub/sub fan-out bridge, and serve.
pub async fn start_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    // Tick cache: Redis when reachable, in-memory otherwise
    let (cache, cache_ok): (Arc<dyn TickCache>, bool) = match RedisTickCache::new().await {
        Ok(cache) => {
            info!("Redis connected");
            (Arc::new(cache), true)
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to Redis");
            warn!("Continuing with in-memory tick cache - single process only");
            (Arc::new(MemoryTickCache::new()), false)
        }
    };

    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(HmacTokenVerifier::new(&config::get_auth_secret()));

    // Relational store: Postgres when configured, in-memory otherwise
    let state = match config::get_database_url() {
        Some(_) => {
            let store = Arc::new(PgStore::new().await?);
            info!("Postgres connected");
            let state = AppState::new(store, cache, verifier, BridgeConfig::default())?;
            state.metrics.database_connected.set(1.0);
            state
        }
        None => {
            warn!("DATABASE_URL not set - using in-memory store, data will not survive restarts");
            let store = Arc::new(MemoryStore::new());
            AppState::new(store, cache, verifier, BridgeConfig::default())?
        }
    };
    state
        .metrics
        .cache_connected
        .set(if cache_ok { 1.0 } else { 0.0 });

    // One pub/sub subscription per process feeds every browser socket
    let stream_bridge = PriceStreamBridge::new(state.cache.clone(), state.fanout.clone());
    stream_bridge.start().await;

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!(port = port, "HTTP server listening on port {}", port);
    axum::serve(listener, app).await?;

    stream_bridge.stop().await;
    Ok(())
}
