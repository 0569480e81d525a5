//! Synchronous-Job Bridge
//!
//! User-facing endpoints enqueue a job for the user's agent and block until
//! it resolves or a deadline passes. The suspension point is a completion
//! notification keyed by job id (signalled by the result-submission
//! handler), raced against a slow store poll and the deadline. Timeouts
//! never cancel the job: the agent may still finish it later.

use chrono::Utc;
use futures_util::future::{FusedFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use crate::models::{Job, JobStatus, JobType, NewJob};
use crate::store::{AgentStore, JobStore, StoreError};

/// Fallback store-poll cadence while waiting on the notification
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Deadline for read-style jobs (account, positions)
pub const READ_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for write-style jobs (orders, closes, candle fetches)
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Cap on a single store call inside the wait loop, so one slow read
/// cannot silently eat the whole deadline
const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    pub read_deadline: Duration,
    pub write_deadline: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            read_deadline: READ_DEADLINE,
            write_deadline: WRITE_DEADLINE,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    /// No connected agent with a fresh heartbeat; nothing was enqueued
    #[error("agent_offline")]
    AgentOffline,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a bounded wait ended. Timeout is distinct from failure: the job may
/// still complete after the caller has gone away.
#[derive(Debug, Clone)]
pub enum BridgeOutcome {
    Completed(Job),
    Failed(Job),
    TimedOut(Job),
}

/// Process-local completion notifications keyed by job id
pub struct JobWaiters {
    inner: Mutex<HashMap<Uuid, Vec<oneshot::Sender<Job>>>>,
}

impl JobWaiters {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in a job's terminal result
    pub async fn subscribe(&self, job_id: Uuid) -> oneshot::Receiver<Job> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.entry(job_id).or_default().push(tx);
        rx
    }

    /// Wake every waiter for this job
    pub async fn notify(&self, job: &Job) {
        if let Some(senders) = self.inner.lock().await.remove(&job.id) {
            for tx in senders {
                // Receiver may have timed out and gone away
                let _ = tx.send(job.clone());
            }
        }
    }

    /// Drop senders whose receivers are gone (called when a wait ends
    /// without a notification, so abandoned jobs do not pin entries)
    pub async fn prune(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(senders) = inner.get_mut(&job_id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                inner.remove(&job_id);
            }
        }
    }

    pub async fn waiting_count(&self) -> usize {
        self.inner.lock().await.values().map(Vec::len).sum()
    }
}

impl Default for JobWaiters {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SyncJobBridge {
    jobs: Arc<dyn JobStore>,
    agents: Arc<dyn AgentStore>,
    waiters: Arc<JobWaiters>,
    config: BridgeConfig,
}

impl SyncJobBridge {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        agents: Arc<dyn AgentStore>,
        waiters: Arc<JobWaiters>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            jobs,
            agents,
            waiters,
            config,
        }
    }

    pub fn read_deadline(&self) -> Duration {
        self.config.read_deadline
    }

    pub fn write_deadline(&self) -> Duration {
        self.config.write_deadline
    }

    /// Fail fast when the user has no reachable agent, so no unclaimable
    /// job is ever enqueued.
    pub async fn require_reachable_agent(&self, user_id: Uuid) -> Result<(), BridgeError> {
        let agent = self
            .agents
            .connected_agent_for_user(user_id)
            .await?
            .ok_or(BridgeError::AgentOffline)?;
        if !agent.is_reachable(Utc::now()) {
            return Err(BridgeError::AgentOffline);
        }
        Ok(())
    }

    /// Enqueue a job and wait for it within `deadline`
    pub async fn run_job(
        &self,
        user_id: Uuid,
        job_type: JobType,
        input_data: Value,
        deadline: Duration,
    ) -> Result<BridgeOutcome, BridgeError> {
        self.require_reachable_agent(user_id).await?;

        let job = self
            .jobs
            .enqueue(NewJob {
                user_id,
                job_type,
                input_data,
            })
            .await?;

        Ok(self.wait(job, deadline).await)
    }

    /// Wait for an already-enqueued job to reach a terminal state.
    ///
    /// Subscribes before the first store read so a result landing in
    /// between cannot be missed.
    pub async fn wait(&self, job: Job, deadline: Duration) -> BridgeOutcome {
        let job_id = job.id;
        let mut last_known = job;
        let mut rx = self.waiters.subscribe(job_id).await.fuse();

        let sleep = time::sleep(deadline);
        tokio::pin!(sleep);
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = &mut sleep => {
                    break BridgeOutcome::TimedOut(last_known);
                }
                notified = &mut rx, if !rx.is_terminated() => {
                    match notified {
                        Ok(job) if job.status.is_terminal() => break Self::terminal(job),
                        // Sender vanished; the poll arm keeps watching
                        _ => {}
                    }
                }
                _ = poll.tick() => {
                    match time::timeout(STORE_CALL_TIMEOUT, self.jobs.get_job(job_id)).await {
                        Ok(Ok(job)) if job.status.is_terminal() => break Self::terminal(job),
                        Ok(Ok(job)) => last_known = job,
                        Ok(Err(e)) => {
                            warn!(job_id = %job_id, error = %e, "Bridge poll failed");
                        }
                        Err(_) => {
                            warn!(job_id = %job_id, "Bridge poll timed out");
                        }
                    }
                }
            }
        };

        self.waiters.prune(job_id).await;
        outcome
    }

    fn terminal(job: Job) -> BridgeOutcome {
        match job.status {
            JobStatus::Failed => BridgeOutcome::Failed(job),
            _ => BridgeOutcome::Completed(job),
        }
    }
}
