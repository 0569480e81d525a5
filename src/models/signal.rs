//! Webhook-sourced signals and EA lifecycle records
//!
//! These are the entities job-result propagation writes back to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Executed,
    Failed,
    Discarded,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Executed => "executed",
            SignalStatus::Failed => "failed",
            SignalStatus::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SignalStatus::Pending),
            "executed" => Some(SignalStatus::Executed),
            "failed" => Some(SignalStatus::Failed),
            "discarded" => Some(SignalStatus::Discarded),
            _ => None,
        }
    }
}

/// A TradingView alert recorded at webhook intake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvSignal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub strategy_id: Uuid,
    pub symbol: Option<String>,
    pub action: Option<String>,
    pub volume: Option<f64>,
    pub status: SignalStatus,
    pub fill_price: Option<f64>,
    pub broker_order_id: Option<String>,
    pub error_message: Option<String>,
    pub raw_payload: Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A webhook-addressable TradingView strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvStrategy {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub webhook_secret: String,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Draft,
    Compiling,
    Compiled,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Compiling => "compiling",
            VersionStatus::Compiled => "compiled",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(VersionStatus::Draft),
            "compiling" => Some(VersionStatus::Compiling),
            "compiled" => Some(VersionStatus::Compiled),
            "failed" => Some(VersionStatus::Failed),
            _ => None,
        }
    }
}

/// A compiled EA source version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EaVersion {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: VersionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Stopped,
    Running,
    Error,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(DeploymentStatus::Stopped),
            "running" => Some(DeploymentStatus::Running),
            "error" => Some(DeploymentStatus::Error),
            _ => None,
        }
    }
}

/// An EA deployed to a chart on the agent's terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EaDeployment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub version_id: Uuid,
    pub status: DeploymentStatus,
}
