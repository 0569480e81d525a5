//! Persistent store interfaces for jobs, agents, and propagation targets
//!
//! The backing relational store is an external collaborator; the rest of the
//! system consumes it through these traits. Two implementations ship:
//! Postgres for production and an in-memory store for tests and
//! database-less development.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::propagation::EntityUpdate;
use crate::models::{AgentRecord, EaDeployment, EaVersion, Job, JobResult, NewJob, TvSignal, TvStrategy};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Per-user risk configuration consulted by the webhook risk gate
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub daily_loss_limit_pct: f64,
    pub cached_balance: f64,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            daily_loss_limit_pct: 5.0,
            cached_balance: 10_000.0,
        }
    }
}

/// The job queue. Claims must be atomic: two concurrent `claim_next` calls
/// never hand out the same job. Selection is oldest-pending-first per user.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Atomically claim the oldest pending job for this user.
    /// `Ok(None)` is the normal empty-queue answer, not an error.
    async fn claim_next(&self, user_id: Uuid, agent_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Record a terminal result. Valid only from `claimed`; resubmitting the
    /// same terminal status is accepted as an idempotent no-op.
    async fn submit_result(&self, job_id: Uuid, result: JobResult) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;
}

/// Paired-agent records
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn insert_agent(&self, agent: AgentRecord) -> Result<(), StoreError>;

    async fn get_agent(&self, id: Uuid) -> Result<AgentRecord, StoreError>;

    /// Unconditional heartbeat write: refreshes the timestamp, marks the
    /// agent connected, and stores the reported status and metrics.
    async fn record_heartbeat(
        &self,
        id: Uuid,
        status: &str,
        metrics: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// The user's connected agent, if any
    async fn connected_agent_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AgentRecord>, StoreError>;
}

/// Entities job-result propagation writes back to, plus the thin webhook
/// lookups. CRUD here is deliberately minimal.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn strategy_by_webhook_secret(
        &self,
        secret: &str,
    ) -> Result<Option<TvStrategy>, StoreError>;
    async fn insert_strategy(&self, strategy: TvStrategy) -> Result<(), StoreError>;

    async fn insert_signal(&self, signal: TvSignal) -> Result<(), StoreError>;
    async fn get_signal(&self, id: Uuid) -> Result<TvSignal, StoreError>;

    async fn insert_version(&self, version: EaVersion) -> Result<(), StoreError>;
    async fn get_version(&self, id: Uuid) -> Result<EaVersion, StoreError>;

    async fn insert_deployment(&self, deployment: EaDeployment) -> Result<(), StoreError>;
    async fn get_deployment(&self, id: Uuid) -> Result<EaDeployment, StoreError>;

    /// Apply a propagation update. Absolute-value writes: reapplying the
    /// same update must leave the entity unchanged.
    async fn apply_update(&self, update: &EntityUpdate, now: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn user_settings(&self, user_id: Uuid) -> Result<UserSettings, StoreError>;

    /// Realized profit/loss recorded since `since` (the risk-gate window)
    async fn realized_pnl_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError>;
}

/// Everything the API server needs from the relational store
pub trait DataStore: JobStore + AgentStore + EntityStore {}

impl<T: JobStore + AgentStore + EntityStore> DataStore for T {}
