//! In-memory store for tests and database-less development
//!
//! A single mutex serializes every operation, which makes the claim
//! trivially atomic: the find-oldest-and-mutate step happens under one
//! critical section.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::jobs::propagation::EntityUpdate;
use crate::models::{
    AgentRecord, EaDeployment, EaVersion, Job, JobResult, JobStatus, NewJob, TvSignal, TvStrategy,
};

use super::{AgentStore, EntityStore, JobStore, StoreError, UserSettings};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    // Insertion order doubles as the FIFO claim order
    job_order: Vec<Uuid>,
    agents: HashMap<Uuid, AgentRecord>,
    strategies: HashMap<Uuid, TvStrategy>,
    signals: HashMap<Uuid, TvSignal>,
    versions: HashMap<Uuid, EaVersion>,
    deployments: HashMap<Uuid, EaDeployment>,
    settings: HashMap<Uuid, UserSettings>,
    pnl_events: Vec<(Uuid, DateTime<Utc>, f64)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user's risk settings (tests and dev fixtures)
    pub async fn set_user_settings(&self, user_id: Uuid, settings: UserSettings) {
        self.inner.lock().await.settings.insert(user_id, settings);
    }

    /// Record a realized P&L event for the risk-gate window
    pub async fn record_pnl(&self, user_id: Uuid, at: DateTime<Utc>, pnl: f64) {
        self.inner.lock().await.pnl_events.push((user_id, at, pnl));
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let job = Job {
            id: Uuid::new_v4(),
            user_id: new_job.user_id,
            job_type: new_job.job_type,
            status: JobStatus::Pending,
            input_data: new_job.input_data,
            output_data: None,
            error_message: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
            claimed_by: None,
        };

        let mut inner = self.inner.lock().await;
        inner.job_order.push(job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, user_id: Uuid, agent_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;

        let next_id = inner.job_order.iter().copied().find(|id| {
            inner
                .jobs
                .get(id)
                .map(|j| j.user_id == user_id && j.status == JobStatus::Pending)
                .unwrap_or(false)
        });

        let Some(id) = next_id else {
            return Ok(None);
        };

        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Claimed;
        job.claimed_at = Some(Utc::now());
        job.claimed_by = Some(agent_id);
        Ok(Some(job.clone()))
    }

    async fn submit_result(&self, job_id: Uuid, result: JobResult) -> Result<Job, StoreError> {
        if !result.status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "result status must be terminal, got {}",
                result.status.as_str()
            )));
        }

        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;

        match job.status {
            JobStatus::Claimed => {
                job.status = result.status;
                job.output_data = result.output_data;
                job.error_message = result.error_message;
                job.completed_at = Some(Utc::now());
                Ok(job.clone())
            }
            // Same terminal status again: idempotent resubmission
            status if status == result.status => Ok(job.clone()),
            status => Err(StoreError::InvalidTransition(format!(
                "cannot move job from {} to {}",
                status.as_str(),
                result.status.as_str()
            ))),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.inner
            .lock()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound("job"))
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert_agent(&self, agent: AgentRecord) -> Result<(), StoreError> {
        self.inner.lock().await.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<AgentRecord, StoreError> {
        self.inner
            .lock()
            .await
            .agents
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("agent"))
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        status: &str,
        metrics: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(&id)
            .ok_or(StoreError::NotFound("agent"))?;
        agent.is_connected = true;
        agent.last_heartbeat = Some(now);
        agent.status = status.to_string();
        agent.metrics = Some(metrics);
        Ok(())
    }

    async fn connected_agent_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AgentRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agents
            .values()
            .filter(|a| a.user_id == user_id && a.is_connected)
            .max_by_key(|a| a.last_heartbeat)
            .cloned())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn strategy_by_webhook_secret(
        &self,
        secret: &str,
    ) -> Result<Option<TvStrategy>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .strategies
            .values()
            .find(|s| s.webhook_secret == secret)
            .cloned())
    }

    async fn insert_strategy(&self, strategy: TvStrategy) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .strategies
            .insert(strategy.id, strategy);
        Ok(())
    }

    async fn insert_signal(&self, signal: TvSignal) -> Result<(), StoreError> {
        self.inner.lock().await.signals.insert(signal.id, signal);
        Ok(())
    }

    async fn get_signal(&self, id: Uuid) -> Result<TvSignal, StoreError> {
        self.inner
            .lock()
            .await
            .signals
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("signal"))
    }

    async fn insert_version(&self, version: EaVersion) -> Result<(), StoreError> {
        self.inner.lock().await.versions.insert(version.id, version);
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<EaVersion, StoreError> {
        self.inner
            .lock()
            .await
            .versions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("ea version"))
    }

    async fn insert_deployment(&self, deployment: EaDeployment) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .deployments
            .insert(deployment.id, deployment);
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<EaDeployment, StoreError> {
        self.inner
            .lock()
            .await
            .deployments
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("deployment"))
    }

    async fn apply_update(
        &self,
        update: &EntityUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match update {
            EntityUpdate::Version { id, status } => {
                let version = inner
                    .versions
                    .get_mut(id)
                    .ok_or(StoreError::NotFound("ea version"))?;
                version.status = *status;
            }
            EntityUpdate::Deployment { id, status } => {
                let deployment = inner
                    .deployments
                    .get_mut(id)
                    .ok_or(StoreError::NotFound("deployment"))?;
                deployment.status = *status;
            }
            EntityUpdate::Signal {
                id,
                status,
                fill_price,
                broker_order_id,
                error_message,
            } => {
                let signal = inner
                    .signals
                    .get_mut(id)
                    .ok_or(StoreError::NotFound("signal"))?;
                signal.status = *status;
                signal.fill_price = *fill_price;
                signal.broker_order_id = broker_order_id.clone();
                signal.error_message = error_message.clone();
                signal.resolved_at = Some(now);
            }
        }
        Ok(())
    }

    async fn user_settings(&self, user_id: Uuid) -> Result<UserSettings, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .settings
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn realized_pnl_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pnl_events
            .iter()
            .filter(|(uid, at, _)| *uid == user_id && *at >= since)
            .map(|(_, _, pnl)| pnl)
            .sum())
    }
}
