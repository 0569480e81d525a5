//! Unit tests for the synchronous-job bridge and its waiter registry

use chrono::{Duration as ChronoDuration, Utc};
use fxbridge::bridge::{BridgeConfig, BridgeError, BridgeOutcome, JobWaiters, SyncJobBridge};
use fxbridge::models::{AgentRecord, JobResult, JobStatus, JobType, NewJob};
use fxbridge::store::{AgentStore, JobStore, MemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn short_config() -> BridgeConfig {
    BridgeConfig {
        poll_interval: Duration::from_millis(50),
        read_deadline: Duration::from_millis(300),
        write_deadline: Duration::from_millis(500),
    }
}

fn bridge_over(store: Arc<MemoryStore>) -> (SyncJobBridge, Arc<JobWaiters>) {
    let waiters = Arc::new(JobWaiters::new());
    let bridge = SyncJobBridge::new(store.clone(), store, waiters.clone(), short_config());
    (bridge, waiters)
}

fn connected_agent(user_id: Uuid, heartbeat_minutes_ago: i64) -> AgentRecord {
    AgentRecord {
        id: Uuid::new_v4(),
        user_id,
        pairing_key_hash: "$2b$12$test".to_string(),
        pairing_key_prefix: "testtest".to_string(),
        is_connected: true,
        last_heartbeat: Some(Utc::now() - ChronoDuration::minutes(heartbeat_minutes_ago)),
        status: "online".to_string(),
        metrics: None,
    }
}

#[tokio::test]
async fn notify_wakes_subscribers() {
    let store = Arc::new(MemoryStore::new());
    let waiters = JobWaiters::new();
    let user = Uuid::new_v4();

    let job = store
        .enqueue(NewJob {
            user_id: user,
            job_type: JobType::GetAccount,
            input_data: json!({}),
        })
        .await
        .unwrap();

    let rx = waiters.subscribe(job.id).await;
    waiters.notify(&job).await;

    let delivered = rx.await.unwrap();
    assert_eq!(delivered.id, job.id);
    assert_eq!(waiters.waiting_count().await, 0);
}

#[tokio::test]
async fn prune_drops_abandoned_waiters() {
    let waiters = JobWaiters::new();
    let job_id = Uuid::new_v4();

    let rx = waiters.subscribe(job_id).await;
    drop(rx);
    assert_eq!(waiters.waiting_count().await, 1);

    waiters.prune(job_id).await;
    assert_eq!(waiters.waiting_count().await, 0);
}

#[tokio::test]
async fn wait_resolves_on_notification() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();
    let agent = Uuid::new_v4();

    let job = store
        .enqueue(NewJob {
            user_id: user,
            job_type: JobType::Trade,
            input_data: json!({ "symbol": "EURUSD" }),
        })
        .await
        .unwrap();

    // Play the agent in the background: claim, resolve, notify
    let store_bg = store.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        store_bg.claim_next(user, agent).await.unwrap();
        let done = store_bg
            .submit_result(
                job_id,
                JobResult {
                    status: JobStatus::Completed,
                    output_data: Some(json!({ "fill_price": 1.0845 })),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        waiters.notify(&done).await;
    });

    match bridge.wait(job, Duration::from_millis(500)).await {
        BridgeOutcome::Completed(job) => {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(
                job.output_data.unwrap()["fill_price"].as_f64(),
                Some(1.0845)
            );
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn wait_falls_back_to_polling_without_a_notification() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, _waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();

    let job = store
        .enqueue(NewJob {
            user_id: user,
            job_type: JobType::GetAccount,
            input_data: json!({}),
        })
        .await
        .unwrap();

    // Resolve through the store only, as if another process handled it
    store.claim_next(user, Uuid::new_v4()).await.unwrap();
    store
        .submit_result(
            job.id,
            JobResult {
                status: JobStatus::Completed,
                output_data: Some(json!({ "balance": 10000.0 })),
                error_message: None,
            },
        )
        .await
        .unwrap();

    match bridge.wait(job, Duration::from_millis(500)).await {
        BridgeOutcome::Completed(job) => assert_eq!(job.status, JobStatus::Completed),
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_jobs_surface_the_agent_error() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();

    let job = store
        .enqueue(NewJob {
            user_id: user,
            job_type: JobType::Trade,
            input_data: json!({ "symbol": "EURUSD" }),
        })
        .await
        .unwrap();
    store.claim_next(user, Uuid::new_v4()).await.unwrap();
    let failed = store
        .submit_result(
            job.id,
            JobResult {
                status: JobStatus::Failed,
                output_data: None,
                error_message: Some("no price for EURUSD".to_string()),
            },
        )
        .await
        .unwrap();
    waiters.notify(&failed).await;

    match bridge.wait(job, Duration::from_millis(500)).await {
        BridgeOutcome::Failed(job) => {
            assert_eq!(job.error_message.as_deref(), Some("no price for EURUSD"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn deadline_yields_timeout_and_leaves_the_job_alone() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, _waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();

    let job = store
        .enqueue(NewJob {
            user_id: user,
            job_type: JobType::Trade,
            input_data: json!({ "symbol": "EURUSD" }),
        })
        .await
        .unwrap();

    // Nobody ever claims it
    match bridge.wait(job.clone(), Duration::from_millis(200)).await {
        BridgeOutcome::TimedOut(last) => assert_eq!(last.status, JobStatus::Pending),
        other => panic!("expected timeout, got {:?}", other),
    }

    // Timeout is an observation, not a mutation
    let stored = store.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

#[tokio::test]
async fn run_job_refuses_without_a_connected_agent() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, _waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();

    let err = bridge
        .run_job(
            user,
            JobType::Trade,
            json!({ "symbol": "EURUSD" }),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::AgentOffline));

    // Nothing was enqueued for an unreachable agent
    assert!(store
        .claim_next(user, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn run_job_refuses_a_stale_agent() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, _waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();

    store
        .insert_agent(connected_agent(user, 15))
        .await
        .unwrap();

    let err = bridge
        .run_job(user, JobType::GetAccount, json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::AgentOffline));
}

#[tokio::test]
async fn run_job_enqueues_for_a_fresh_agent() {
    let store = Arc::new(MemoryStore::new());
    let (bridge, _waiters) = bridge_over(store.clone());
    let user = Uuid::new_v4();

    store.insert_agent(connected_agent(user, 1)).await.unwrap();

    // No agent process is polling, so the bounded wait times out - but the
    // job exists and stays claimable
    match bridge
        .run_job(user, JobType::GetAccount, json!({}), Duration::from_millis(150))
        .await
        .unwrap()
    {
        BridgeOutcome::TimedOut(job) => {
            let stored = store.get_job(job.id).await.unwrap();
            assert_eq!(stored.status, JobStatus::Pending);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}
