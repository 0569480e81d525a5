//! Postgres-backed store
//!
//! The claim uses a single-statement `FOR UPDATE SKIP LOCKED` update so that
//! concurrent claimants contend on row locks, not on application state, and
//! losers skip to "no job" instead of blocking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::{Client, NoTls, Row};
use uuid::Uuid;

use crate::config;
use crate::jobs::propagation::EntityUpdate;
use crate::models::{
    AgentRecord, DeploymentStatus, EaDeployment, EaVersion, Job, JobResult, JobStatus, JobType,
    NewJob, SignalStatus, TvSignal, TvStrategy, VersionStatus,
};

use super::{AgentStore, EntityStore, JobStore, StoreError, UserSettings};

const JOB_COLUMNS: &str = "id, user_id, job_type, status, input_data, output_data, \
     error_message, created_at, claimed_at, completed_at, claimed_by";

pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub async fn new() -> Result<Self, StoreError> {
        let url = config::get_database_url()
            .ok_or_else(|| StoreError::Unavailable("DATABASE_URL not set".to_string()))?;
        Self::connect(&url).await
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        let store = Self { client };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    job_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    input_data JSONB NOT NULL,
                    output_data JSONB,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL,
                    claimed_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    claimed_by UUID
                );
                CREATE INDEX IF NOT EXISTS jobs_pending_idx
                    ON jobs (user_id, created_at) WHERE status = 'pending';
                CREATE TABLE IF NOT EXISTS agents (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    pairing_key_hash TEXT NOT NULL,
                    pairing_key_prefix TEXT NOT NULL,
                    is_connected BOOLEAN NOT NULL DEFAULT FALSE,
                    last_heartbeat TIMESTAMPTZ,
                    status TEXT NOT NULL DEFAULT 'offline',
                    metrics JSONB
                );
                CREATE TABLE IF NOT EXISTS tv_strategies (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    name TEXT NOT NULL,
                    webhook_secret TEXT NOT NULL UNIQUE,
                    is_enabled BOOLEAN NOT NULL DEFAULT TRUE
                );
                CREATE TABLE IF NOT EXISTS tv_signals (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    strategy_id UUID NOT NULL,
                    symbol TEXT,
                    action TEXT,
                    volume DOUBLE PRECISION,
                    status TEXT NOT NULL,
                    fill_price DOUBLE PRECISION,
                    broker_order_id TEXT,
                    error_message TEXT,
                    raw_payload JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    resolved_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS ea_versions (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    status TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS ea_deployments (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    version_id UUID NOT NULL,
                    status TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS user_settings (
                    user_id UUID PRIMARY KEY,
                    daily_loss_limit_pct DOUBLE PRECISION NOT NULL DEFAULT 5.0,
                    cached_balance DOUBLE PRECISION NOT NULL DEFAULT 10000.0
                );
                CREATE TABLE IF NOT EXISTS trade_events (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL,
                    profit_loss DOUBLE PRECISION NOT NULL DEFAULT 0.0,
                    created_at TIMESTAMPTZ NOT NULL
                );",
            )
            .await
            .map_err(|e| StoreError::Backend(format!("failed to init schema: {}", e)))
    }

    fn job_from_row(row: &Row) -> Result<Job, StoreError> {
        let job_type_str: String = row.get(2);
        let status_str: String = row.get(3);
        Ok(Job {
            id: row.get(0),
            user_id: row.get(1),
            job_type: JobType::parse(&job_type_str)
                .ok_or_else(|| StoreError::Backend(format!("unknown job_type {}", job_type_str)))?,
            status: JobStatus::parse(&status_str)
                .ok_or_else(|| StoreError::Backend(format!("unknown status {}", status_str)))?,
            input_data: row.get(4),
            output_data: row.get(5),
            error_message: row.get(6),
            created_at: row.get(7),
            claimed_at: row.get(8),
            completed_at: row.get(9),
            claimed_by: row.get(10),
        })
    }

    fn agent_from_row(row: &Row) -> AgentRecord {
        AgentRecord {
            id: row.get(0),
            user_id: row.get(1),
            pairing_key_hash: row.get(2),
            pairing_key_prefix: row.get(3),
            is_connected: row.get(4),
            last_heartbeat: row.get(5),
            status: row.get(6),
            metrics: row.get(7),
        }
    }
}

fn backend(e: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = self
            .client
            .query_one(
                &format!(
                    "INSERT INTO jobs (id, user_id, job_type, status, input_data, created_at)
                     VALUES ($1, $2, $3, 'pending', $4, $5)
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                &[
                    &id,
                    &new_job.user_id,
                    &new_job.job_type.as_str(),
                    &new_job.input_data,
                    &now,
                ],
            )
            .await
            .map_err(backend)?;
        Self::job_from_row(&row)
    }

    async fn claim_next(&self, user_id: Uuid, agent_id: Uuid) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let rows = self
            .client
            .query(
                &format!(
                    "UPDATE jobs
                     SET status = 'claimed', claimed_at = $3, claimed_by = $2
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE user_id = $1 AND status = 'pending'
                         ORDER BY created_at ASC
                         LIMIT 1
                         FOR UPDATE SKIP LOCKED
                     )
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                &[&user_id, &agent_id, &now],
            )
            .await
            .map_err(backend)?;

        match rows.first() {
            Some(row) => Ok(Some(Self::job_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn submit_result(&self, job_id: Uuid, result: JobResult) -> Result<Job, StoreError> {
        if !result.status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "result status must be terminal, got {}",
                result.status.as_str()
            )));
        }

        let now = Utc::now();
        let rows = self
            .client
            .query(
                &format!(
                    "UPDATE jobs
                     SET status = $2, output_data = $3, error_message = $4, completed_at = $5
                     WHERE id = $1 AND status = 'claimed'
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                &[
                    &job_id,
                    &result.status.as_str(),
                    &result.output_data,
                    &result.error_message,
                    &now,
                ],
            )
            .await
            .map_err(backend)?;

        if let Some(row) = rows.first() {
            return Self::job_from_row(row);
        }

        // Not in claimed state: either idempotent resubmission or a bad
        // transition. Look at the stored job to tell them apart.
        let job = self.get_job(job_id).await?;
        if job.status == result.status {
            Ok(job)
        } else {
            Err(StoreError::InvalidTransition(format!(
                "cannot move job from {} to {}",
                job.status.as_str(),
                result.status.as_str()
            )))
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let rows = self
            .client
            .query(
                &format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS),
                &[&job_id],
            )
            .await
            .map_err(backend)?;
        match rows.first() {
            Some(row) => Self::job_from_row(row),
            None => Err(StoreError::NotFound("job")),
        }
    }
}

const AGENT_COLUMNS: &str =
    "id, user_id, pairing_key_hash, pairing_key_prefix, is_connected, last_heartbeat, status, metrics";

#[async_trait]
impl AgentStore for PgStore {
    async fn insert_agent(&self, agent: AgentRecord) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO agents (id, user_id, pairing_key_hash, pairing_key_prefix,
                                     is_connected, last_heartbeat, status, metrics)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &agent.id,
                    &agent.user_id,
                    &agent.pairing_key_hash,
                    &agent.pairing_key_prefix,
                    &agent.is_connected,
                    &agent.last_heartbeat,
                    &agent.status,
                    &agent.metrics,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<AgentRecord, StoreError> {
        let rows = self
            .client
            .query(
                &format!("SELECT {} FROM agents WHERE id = $1", AGENT_COLUMNS),
                &[&id],
            )
            .await
            .map_err(backend)?;
        rows.first()
            .map(Self::agent_from_row)
            .ok_or(StoreError::NotFound("agent"))
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        status: &str,
        metrics: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE agents
                 SET is_connected = TRUE, last_heartbeat = $2, status = $3, metrics = $4
                 WHERE id = $1",
                &[&id, &now, &status, &metrics],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound("agent"));
        }
        Ok(())
    }

    async fn connected_agent_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AgentRecord>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {} FROM agents
                     WHERE user_id = $1 AND is_connected = TRUE
                     ORDER BY last_heartbeat DESC NULLS LAST
                     LIMIT 1",
                    AGENT_COLUMNS
                ),
                &[&user_id],
            )
            .await
            .map_err(backend)?;
        Ok(rows.first().map(Self::agent_from_row))
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn strategy_by_webhook_secret(
        &self,
        secret: &str,
    ) -> Result<Option<TvStrategy>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, name, webhook_secret, is_enabled
                 FROM tv_strategies WHERE webhook_secret = $1",
                &[&secret],
            )
            .await
            .map_err(backend)?;
        Ok(rows.first().map(|row| TvStrategy {
            id: row.get(0),
            user_id: row.get(1),
            name: row.get(2),
            webhook_secret: row.get(3),
            is_enabled: row.get(4),
        }))
    }

    async fn insert_strategy(&self, strategy: TvStrategy) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO tv_strategies (id, user_id, name, webhook_secret, is_enabled)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &strategy.id,
                    &strategy.user_id,
                    &strategy.name,
                    &strategy.webhook_secret,
                    &strategy.is_enabled,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn insert_signal(&self, signal: TvSignal) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO tv_signals (id, user_id, strategy_id, symbol, action, volume,
                                         status, fill_price, broker_order_id, error_message,
                                         raw_payload, created_at, resolved_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &signal.id,
                    &signal.user_id,
                    &signal.strategy_id,
                    &signal.symbol,
                    &signal.action,
                    &signal.volume,
                    &signal.status.as_str(),
                    &signal.fill_price,
                    &signal.broker_order_id,
                    &signal.error_message,
                    &signal.raw_payload,
                    &signal.created_at,
                    &signal.resolved_at,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_signal(&self, id: Uuid) -> Result<TvSignal, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, strategy_id, symbol, action, volume, status,
                        fill_price, broker_order_id, error_message, raw_payload,
                        created_at, resolved_at
                 FROM tv_signals WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(backend)?;
        let row = rows.first().ok_or(StoreError::NotFound("signal"))?;
        let status_str: String = row.get(6);
        Ok(TvSignal {
            id: row.get(0),
            user_id: row.get(1),
            strategy_id: row.get(2),
            symbol: row.get(3),
            action: row.get(4),
            volume: row.get(5),
            status: SignalStatus::parse(&status_str)
                .ok_or_else(|| StoreError::Backend(format!("unknown status {}", status_str)))?,
            fill_price: row.get(7),
            broker_order_id: row.get(8),
            error_message: row.get(9),
            raw_payload: row.get(10),
            created_at: row.get(11),
            resolved_at: row.get(12),
        })
    }

    async fn insert_version(&self, version: EaVersion) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO ea_versions (id, user_id, status) VALUES ($1, $2, $3)",
                &[&version.id, &version.user_id, &version.status.as_str()],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<EaVersion, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, status FROM ea_versions WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(backend)?;
        let row = rows.first().ok_or(StoreError::NotFound("ea version"))?;
        let status_str: String = row.get(2);
        Ok(EaVersion {
            id: row.get(0),
            user_id: row.get(1),
            status: VersionStatus::parse(&status_str)
                .ok_or_else(|| StoreError::Backend(format!("unknown status {}", status_str)))?,
        })
    }

    async fn insert_deployment(&self, deployment: EaDeployment) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO ea_deployments (id, user_id, version_id, status)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &deployment.id,
                    &deployment.user_id,
                    &deployment.version_id,
                    &deployment.status.as_str(),
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<EaDeployment, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, version_id, status FROM ea_deployments WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(backend)?;
        let row = rows.first().ok_or(StoreError::NotFound("deployment"))?;
        let status_str: String = row.get(3);
        Ok(EaDeployment {
            id: row.get(0),
            user_id: row.get(1),
            version_id: row.get(2),
            status: DeploymentStatus::parse(&status_str)
                .ok_or_else(|| StoreError::Backend(format!("unknown status {}", status_str)))?,
        })
    }

    async fn apply_update(
        &self,
        update: &EntityUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match update {
            EntityUpdate::Version { id, status } => {
                self.client
                    .execute(
                        "UPDATE ea_versions SET status = $2 WHERE id = $1",
                        &[id, &status.as_str()],
                    )
                    .await
                    .map_err(backend)?;
            }
            EntityUpdate::Deployment { id, status } => {
                self.client
                    .execute(
                        "UPDATE ea_deployments SET status = $2 WHERE id = $1",
                        &[id, &status.as_str()],
                    )
                    .await
                    .map_err(backend)?;
            }
            EntityUpdate::Signal {
                id,
                status,
                fill_price,
                broker_order_id,
                error_message,
            } => {
                self.client
                    .execute(
                        "UPDATE tv_signals
                         SET status = $2, fill_price = $3, broker_order_id = $4,
                             error_message = $5, resolved_at = $6
                         WHERE id = $1",
                        &[
                            id,
                            &status.as_str(),
                            fill_price,
                            broker_order_id,
                            error_message,
                            &now,
                        ],
                    )
                    .await
                    .map_err(backend)?;
            }
        }
        Ok(())
    }

    async fn user_settings(&self, user_id: Uuid) -> Result<UserSettings, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT daily_loss_limit_pct, cached_balance
                 FROM user_settings WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(backend)?;
        Ok(rows
            .first()
            .map(|row| UserSettings {
                daily_loss_limit_pct: row.get(0),
                cached_balance: row.get(1),
            })
            .unwrap_or_default())
    }

    async fn realized_pnl_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT COALESCE(SUM(profit_loss), 0.0)
                 FROM trade_events WHERE user_id = $1 AND created_at >= $2",
                &[&user_id, &since],
            )
            .await
            .map_err(backend)?;
        Ok(row.get(0))
    }
}
