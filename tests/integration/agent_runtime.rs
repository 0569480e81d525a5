//! Integration tests for the desktop agent's API client and executor
//!
//! The backend is mocked with wiremock; the terminal is the simulated one.

use fxbridge::agent::runner::execute_job;
use fxbridge::agent::{AgentConfig, ApiClient, ClientError, SimTerminal};
use fxbridge::models::JobStatus;
use serde_json::json;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, agent_id: Uuid, key: &str) -> AgentConfig {
    AgentConfig {
        agent_id,
        agent_key: key.to_string(),
        api_url: Url::parse(&server.uri()).unwrap(),
    }
}

#[tokio::test]
async fn agent_claims_executes_and_reports_a_trade_job() {
    let backend = MockServer::start().await;
    let agent_id = Uuid::new_v4();
    let job_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/agents/{}/jobs/next", agent_id)))
        .and(header("X-Agent-Key", "raw-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job_id": job_id,
            "job_type": "trade",
            "input_data": { "symbol": "EURUSD", "side": "buy", "volume": 0.1 },
        })))
        .expect(1)
        .mount(&backend)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/agents/{}/jobs/{}/result", agent_id, job_id)))
        .and(body_partial_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&backend)
        .await;

    let client = ApiClient::new(&config_for(&backend, agent_id, "raw-key")).unwrap();
    let terminal = SimTerminal::new();

    let job = client.next_job().await.unwrap().expect("a claimed job");
    assert_eq!(job.job_id, job_id);

    let result = execute_job(&terminal, &job).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.output_data.as_ref().unwrap()["fill_price"]
        .as_f64()
        .is_some());

    client.submit_result(job.job_id, &result).await.unwrap();
}

#[tokio::test]
async fn empty_queue_is_not_an_error() {
    let backend = MockServer::start().await;
    let agent_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/agents/{}/jobs/next", agent_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "no_jobs": true })))
        .mount(&backend)
        .await;

    let client = ApiClient::new(&config_for(&backend, agent_id, "raw-key")).unwrap();
    assert!(client.next_job().await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_credentials_are_fatal_not_retried() {
    let backend = MockServer::start().await;
    let agent_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/agents/{}/jobs/next", agent_id)))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&backend)
        .await;

    let client = ApiClient::new(&config_for(&backend, agent_id, "stale-key")).unwrap();
    let err = client.next_job().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized));
}

#[tokio::test]
async fn heartbeat_reports_status_and_metrics() {
    let backend = MockServer::start().await;
    let agent_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/agents/{}/heartbeat", agent_id)))
        .and(header("X-Agent-Id", agent_id.to_string()))
        .and(body_partial_json(json!({ "status": "online" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&backend)
        .await;

    let client = ApiClient::new(&config_for(&backend, agent_id, "raw-key")).unwrap();
    client
        .heartbeat("online", json!({ "jobs_processed": 3 }))
        .await
        .unwrap();
}

#[tokio::test]
async fn price_pushes_report_the_accepted_count() {
    let backend = MockServer::start().await;
    let agent_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/agents/{}/prices", agent_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "received": 2 })))
        .expect(1)
        .mount(&backend)
        .await;

    let client = ApiClient::new(&config_for(&backend, agent_id, "raw-key")).unwrap();
    let terminal = SimTerminal::new();

    let mut quotes = std::collections::HashMap::new();
    for symbol in ["EURUSD", "GBPUSD"] {
        let tick = fxbridge::agent::TerminalBridge::current_tick(&terminal, symbol)
            .await
            .unwrap();
        quotes.insert(
            symbol.to_string(),
            fxbridge::agent::client::QuotePush {
                bid: tick.bid,
                ask: tick.ask,
                time: tick.time,
            },
        );
    }

    assert_eq!(client.push_prices(&quotes).await.unwrap(), 2);
}
