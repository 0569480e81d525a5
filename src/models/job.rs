//! Job queue records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of work the agent knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Trade,
    ClosePosition,
    GetPositions,
    GetAccount,
    GetCandles,
    Compile,
    Deploy,
    Run,
    Stop,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Trade => "trade",
            JobType::ClosePosition => "close_position",
            JobType::GetPositions => "get_positions",
            JobType::GetAccount => "get_account",
            JobType::GetCandles => "get_candles",
            JobType::Compile => "compile",
            JobType::Deploy => "deploy",
            JobType::Run => "run",
            JobType::Stop => "stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trade" => Some(JobType::Trade),
            "close_position" => Some(JobType::ClosePosition),
            "get_positions" => Some(JobType::GetPositions),
            "get_account" => Some(JobType::GetAccount),
            "get_candles" => Some(JobType::GetCandles),
            "compile" => Some(JobType::Compile),
            "deploy" => Some(JobType::Deploy),
            "run" => Some(JobType::Run),
            "stop" => Some(JobType::Stop),
            _ => None,
        }
    }
}

/// Lifecycle state. Transitions are monotonic:
/// pending -> claimed -> completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "claimed" => Some(JobStatus::Claimed),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<Uuid>,
}

/// Insert payload for a new pending job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: Uuid,
    pub job_type: JobType,
    pub input_data: Value,
}

/// Terminal outcome reported by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
}
