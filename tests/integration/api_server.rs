//! Integration tests for the API Server
//!
//! Covers the agent protocol (pairing, heartbeat, claim, result), the
//! synchronous trading endpoints over the job bridge, webhook intake, and
//! result propagation.


use chrono::{Duration as ChronoDuration, Utc};
use fxbridge::models::{
    AgentRecord, DeploymentStatus, EaDeployment, EaVersion, JobStatus, SignalStatus, TvStrategy,
    VersionStatus,
};
use fxbridge::store::{AgentStore, EntityStore, JobStore};
use serde_json::{json, Value};
use uuid::Uuid;

use test_utils::{resolve_next_job, TestApiServer};

#[tokio::test]
async fn health_endpoint_reports_healthy_status() {
    let app = TestApiServer::new().await;
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["uptime_seconds"].as_u64().is_some());
    assert_eq!(body["service"], "fxbridge-api");
}

#[tokio::test]
async fn metrics_endpoint_exposes_prometheus_metrics() {
    let app = TestApiServer::new().await;
    let response = app.server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);

    let body = response.text();
    assert!(body.contains("http_requests_total"));
    assert!(body.contains("jobs_enqueued_total"));
    assert!(body.contains("ws_clients_connected"));
}

#[tokio::test]
async fn pairing_returns_the_key_once_and_stores_only_a_hash() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();

    let (agent_id, key) = app.pair_agent(user_id).await;
    assert!(key.len() >= 40, "256-bit key should encode to 40+ chars");

    let stored = app.store.get_agent(agent_id).await.unwrap();
    assert_ne!(stored.pairing_key_hash, key);
    assert!(stored.pairing_key_hash.starts_with("$2"));
    assert_eq!(stored.pairing_key_prefix, key[..8]);
    assert!(!stored.is_connected);
}

#[tokio::test]
async fn pairing_requires_a_user_token() {
    let app = TestApiServer::new().await;
    let response = app.server.post("/agents/pair").await;
    assert_eq!(response.status_code(), 401);

    let response = app
        .server
        .post("/agents/pair")
        .authorization_bearer("garbage.token")
        .await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn heartbeat_flips_the_agent_to_online() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;

    app.heartbeat(agent_id, &key).await;

    let response = app
        .server
        .get(&format!("/agents/{}/status", agent_id))
        .authorization_bearer(app.user_token(user_id))
        .await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["status"], "online");
    assert_eq!(body["is_connected"], true);
    assert!(body["last_heartbeat"].as_str().is_some());
}

#[tokio::test]
async fn wrong_pairing_key_is_rejected_at_the_boundary() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, _key) = app.pair_agent(user_id).await;

    let response = app
        .server
        .get(&format!("/agents/{}/jobs/next", agent_id))
        .add_header("X-Agent-Id", agent_id.to_string())
        .add_header("X-Agent-Key", "not-the-key")
        .await;
    assert_eq!(response.status_code(), 401);

    let response = app
        .server
        .post(&format!("/agents/{}/heartbeat", agent_id))
        .add_header("X-Agent-Key", "not-the-key")
        .json(&json!({ "status": "online" }))
        .await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn empty_queue_answers_no_jobs() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;

    let response = app
        .server
        .get(&format!("/agents/{}/jobs/next", agent_id))
        .add_header("X-Agent-Id", agent_id.to_string())
        .add_header("X-Agent-Key", key)
        .await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["no_jobs"], true);
}

#[tokio::test]
async fn orders_without_a_connected_agent_fail_fast() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();

    let response = app
        .server
        .post("/trading/orders")
        .authorization_bearer(app.user_token(user_id))
        .json(&json!({ "symbol": "EURUSD", "side": "buy", "volume": 0.1 }))
        .await;
    assert_eq!(response.status_code(), 503);

    let body: Value = response.json();
    assert_eq!(body["detail"], "agent_offline");

    // Precondition failures must not leave an orphaned job behind
    assert!(app
        .store
        .claim_next(user_id, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn orders_with_a_stale_agent_fail_fast() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();

    app.store
        .insert_agent(AgentRecord {
            id: Uuid::new_v4(),
            user_id,
            pairing_key_hash: "$2b$12$unused".to_string(),
            pairing_key_prefix: "unusedpx".to_string(),
            is_connected: true,
            last_heartbeat: Some(Utc::now() - ChronoDuration::minutes(15)),
            status: "online".to_string(),
            metrics: None,
        })
        .await
        .unwrap();

    let response = app
        .server
        .post("/trading/orders")
        .authorization_bearer(app.user_token(user_id))
        .json(&json!({ "symbol": "EURUSD", "side": "buy", "volume": 0.1 }))
        .await;
    assert_eq!(response.status_code(), 503);
}

#[tokio::test]
async fn order_round_trips_through_the_agent() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    let order = app
        .server
        .post("/trading/orders")
        .authorization_bearer(app.user_token(user_id))
        .json(&json!({ "symbol": "EURUSD", "side": "buy", "volume": 0.1 }));

    let (response, claimed) = tokio::join!(
        order,
        resolve_next_job(
            &app.server,
            agent_id,
            &key,
            JobStatus::Completed,
            json!({ "fill_price": 1.0845, "order_id": "123" }),
            None,
        )
    );

    assert_eq!(claimed["job_type"], "trade");
    assert_eq!(claimed["input_data"]["symbol"], "EURUSD");

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "filled");
    assert_eq!(body["fill_price"].as_f64(), Some(1.0845));
    assert_eq!(
        body["order_id"].as_str().unwrap(),
        claimed["job_id"].as_str().unwrap()
    );
}

#[tokio::test]
async fn failed_execution_surfaces_the_agent_reason() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    let order = app
        .server
        .post("/trading/orders")
        .authorization_bearer(app.user_token(user_id))
        .json(&json!({ "symbol": "EURUSD", "side": "buy", "volume": 99.0 }));

    let (response, _) = tokio::join!(
        order,
        resolve_next_job(
            &app.server,
            agent_id,
            &key,
            JobStatus::Failed,
            json!(null),
            Some("not enough margin".to_string()),
        )
    );

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["error_message"], "not enough margin");
}

#[tokio::test]
async fn unresolved_orders_time_out_as_pending_without_mutating_the_job() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    // No agent claims anything: the write deadline (shortened in tests)
    // elapses
    let response = app
        .server
        .post("/trading/orders")
        .authorization_bearer(app.user_token(user_id))
        .json(&json!({ "symbol": "EURUSD", "side": "buy", "volume": 0.1 }))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "pending");

    let job_id = Uuid::parse_str(body["order_id"].as_str().unwrap()).unwrap();
    let job = app.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn positions_return_empty_when_no_agent_is_connected() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();

    let response = app
        .server
        .get("/trading/positions")
        .authorization_bearer(app.user_token(user_id))
        .await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn account_round_trips_through_the_agent() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    let account = app
        .server
        .get("/trading/account")
        .authorization_bearer(app.user_token(user_id));

    let (response, _) = tokio::join!(
        account,
        resolve_next_job(
            &app.server,
            agent_id,
            &key,
            JobStatus::Completed,
            json!({
                "balance": 10000.0,
                "equity": 10120.5,
                "margin_used": 200.0,
                "margin_available": 9920.5,
                "currency": "USD",
                "leverage": 100,
            }),
            None,
        )
    );

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["equity"].as_f64(), Some(10120.5));
    assert_eq!(body["currency"], "USD");
}

#[tokio::test]
async fn candle_responses_are_cached_for_subsequent_reads() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    let candles = json!([
        { "time": "2026-08-06T00:00:00Z", "open": 1.08, "high": 1.0825, "low": 1.079, "close": 1.0815, "volume": 1000.0 }
    ]);

    let request = app
        .server
        .get("/trading/candles/EURUSD")
        .authorization_bearer(app.user_token(user_id));

    let (response, claimed) = tokio::join!(
        request,
        resolve_next_job(
            &app.server,
            agent_id,
            &key,
            JobStatus::Completed,
            json!({ "candles": candles }),
            None,
        )
    );

    assert_eq!(claimed["job_type"], "get_candles");
    assert_eq!(claimed["input_data"]["timeframe"], "H1");
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body, candles);

    // Second read is served from cache: no new job, no agent involved
    let response = app
        .server
        .get("/trading/candles/EURUSD")
        .authorization_bearer(app.user_token(user_id))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body, candles);
    assert!(app
        .store
        .claim_next(user_id, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn price_pushes_land_in_the_relay_cache() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;

    let response = app
        .server
        .post(&format!("/agents/{}/prices", agent_id))
        .add_header("X-Agent-Id", agent_id.to_string())
        .add_header("X-Agent-Key", key)
        .json(&json!({
            "EURUSD": { "bid": 1.0845, "ask": 1.0847 },
            "GBPUSD": { "bid": 1.2710, "ask": 1.2713 },
        }))
        .await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["received"].as_u64(), Some(2));

    let tick = app
        .state
        .relay
        .get_cached_tick("EURUSD")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tick.bid, 1.0845);
    assert_eq!(tick.ask, 1.0847);
}

#[tokio::test]
async fn webhook_signal_executes_end_to_end() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    app.store
        .insert_strategy(TvStrategy {
            id: Uuid::new_v4(),
            user_id,
            name: "breakout".to_string(),
            webhook_secret: "whsec-test".to_string(),
            is_enabled: true,
        })
        .await
        .unwrap();

    let response = app
        .server
        .post("/webhooks/tv/whsec-test")
        .json(&json!({ "symbol": "EURUSD", "action": "BUY", "volume": 0.1 }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");

    // The webhook queued a trade job carrying the signal id; play the agent
    let claimed = resolve_next_job(
        &app.server,
        agent_id,
        &key,
        JobStatus::Completed,
        json!({ "fill_price": 1.0845, "order_id": "123" }),
        None,
    )
    .await;

    assert_eq!(claimed["job_type"], "trade");
    let signal_id =
        Uuid::parse_str(claimed["input_data"]["signal_id"].as_str().unwrap()).unwrap();

    let signal = app.store.get_signal(signal_id).await.unwrap();
    assert_eq!(signal.status, SignalStatus::Executed);
    assert_eq!(signal.fill_price, Some(1.0845));
    assert_eq!(signal.broker_order_id.as_deref(), Some("123"));
    assert!(signal.resolved_at.is_some());
}

#[tokio::test]
async fn webhook_with_unknown_secret_answers_ok_and_records_nothing() {
    let app = TestApiServer::new().await;

    let response = app
        .server
        .post("/webhooks/tv/no-such-secret")
        .json(&json!({ "symbol": "EURUSD", "action": "buy" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn webhook_for_a_disabled_strategy_discards_the_signal() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();

    app.store
        .insert_strategy(TvStrategy {
            id: Uuid::new_v4(),
            user_id,
            name: "paused".to_string(),
            webhook_secret: "whsec-paused".to_string(),
            is_enabled: false,
        })
        .await
        .unwrap();

    let response = app
        .server
        .post("/webhooks/tv/whsec-paused")
        .json(&json!({ "symbol": "EURUSD", "action": "buy", "volume": 0.1 }))
        .await;
    assert_eq!(response.status_code(), 200);

    // No job was queued for the disabled strategy
    assert!(app
        .store
        .claim_next(user_id, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn webhook_honors_the_daily_loss_limit() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();

    app.store
        .insert_strategy(TvStrategy {
            id: Uuid::new_v4(),
            user_id,
            name: "risky".to_string(),
            webhook_secret: "whsec-risky".to_string(),
            is_enabled: true,
        })
        .await
        .unwrap();
    app.store
        .set_user_settings(
            user_id,
            fxbridge::store::UserSettings {
                daily_loss_limit_pct: 5.0,
                cached_balance: 10_000.0,
            },
        )
        .await;
    // 600 lost today on a 10k balance: past the 5% limit
    app.store.record_pnl(user_id, Utc::now(), -600.0).await;

    let response = app
        .server
        .post("/webhooks/tv/whsec-risky")
        .json(&json!({ "symbol": "EURUSD", "action": "buy", "volume": 0.1 }))
        .await;
    assert_eq!(response.status_code(), 200);

    // Signal discarded, nothing queued
    assert!(app
        .store
        .claim_next(user_id, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn compile_results_propagate_to_the_version() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    let version_id = Uuid::new_v4();
    app.store
        .insert_version(EaVersion {
            id: version_id,
            user_id,
            status: VersionStatus::Draft,
        })
        .await
        .unwrap();

    let response = app
        .server
        .post(&format!("/ea/versions/{}/compile", version_id))
        .authorization_bearer(app.user_token(user_id))
        .await;
    assert_eq!(response.status_code(), 200);

    let version = app.store.get_version(version_id).await.unwrap();
    assert_eq!(version.status, VersionStatus::Compiling);

    resolve_next_job(
        &app.server,
        agent_id,
        &key,
        JobStatus::Completed,
        json!({ "compiled": true }),
        None,
    )
    .await;

    let version = app.store.get_version(version_id).await.unwrap();
    assert_eq!(version.status, VersionStatus::Compiled);
}

#[tokio::test]
async fn failed_deployment_start_marks_the_deployment_errored() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    let deployment_id = Uuid::new_v4();
    app.store
        .insert_deployment(EaDeployment {
            id: deployment_id,
            user_id,
            version_id: Uuid::new_v4(),
            status: DeploymentStatus::Stopped,
        })
        .await
        .unwrap();

    let response = app
        .server
        .post(&format!("/deployments/{}/start", deployment_id))
        .authorization_bearer(app.user_token(user_id))
        .await;
    assert_eq!(response.status_code(), 200);

    resolve_next_job(
        &app.server,
        agent_id,
        &key,
        JobStatus::Failed,
        json!(null),
        Some("chart open failed".to_string()),
    )
    .await;

    let deployment = app.store.get_deployment(deployment_id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Error);
}

#[tokio::test]
async fn resubmitting_a_result_does_not_double_apply_propagation() {
    let app = TestApiServer::new().await;
    let user_id = Uuid::new_v4();
    let (agent_id, key) = app.pair_agent(user_id).await;
    app.heartbeat(agent_id, &key).await;

    app.store
        .insert_strategy(TvStrategy {
            id: Uuid::new_v4(),
            user_id,
            name: "retry".to_string(),
            webhook_secret: "whsec-retry".to_string(),
            is_enabled: true,
        })
        .await
        .unwrap();
    app.server
        .post("/webhooks/tv/whsec-retry")
        .json(&json!({ "symbol": "EURUSD", "action": "buy", "volume": 0.1 }))
        .await;

    let claimed = resolve_next_job(
        &app.server,
        agent_id,
        &key,
        JobStatus::Completed,
        json!({ "fill_price": 1.0845, "order_id": "123" }),
        None,
    )
    .await;
    let job_id = claimed["job_id"].as_str().unwrap();
    let signal_id =
        Uuid::parse_str(claimed["input_data"]["signal_id"].as_str().unwrap()).unwrap();

    // The agent retries the same submission (network hiccup on the ack)
    let response = app
        .server
        .post(&format!("/agents/{}/jobs/{}/result", agent_id, job_id))
        .add_header("X-Agent-Id", agent_id.to_string())
        .add_header("X-Agent-Key", key)
        .json(&json!({
            "status": "completed",
            "output_data": { "fill_price": 1.0845, "order_id": "123" },
        }))
        .await;
    assert_eq!(response.status_code(), 200);

    let signal = app.store.get_signal(signal_id).await.unwrap();
    assert_eq!(signal.status, SignalStatus::Executed);
    assert_eq!(signal.fill_price, Some(1.0845));
    assert_eq!(signal.broker_order_id.as_deref(), Some("123"));
}

#[tokio::test]
async fn agent_status_for_an_unknown_agent_is_404() {
    let app = TestApiServer::new().await;
    let response = app
        .server
        .get(&format!("/agents/{}/status", Uuid::new_v4()))
        .authorization_bearer(app.user_token(Uuid::new_v4()))
        .await;
    assert_eq!(response.status_code(), 404);
}
