//! Mapping from terminal job results to entity updates
//!
//! When an agent reports a result, some job types carry a status change for
//! a downstream entity: a compiled EA version, a deployment, or the webhook
//! signal that triggered a trade. The mapping is a pure function so it can
//! be matched exhaustively and tested without a store; applying an update is
//! an absolute-value write, so reapplying the same result is harmless.

use serde_json::Value;
use uuid::Uuid;

use crate::models::{DeploymentStatus, Job, JobStatus, JobType, SignalStatus, VersionStatus};

/// An entity write derived from a terminal job result
#[derive(Debug, Clone, PartialEq)]
pub enum EntityUpdate {
    Version {
        id: Uuid,
        status: VersionStatus,
    },
    Deployment {
        id: Uuid,
        status: DeploymentStatus,
    },
    Signal {
        id: Uuid,
        status: SignalStatus,
        fill_price: Option<f64>,
        broker_order_id: Option<String>,
        error_message: Option<String>,
    },
}

fn uuid_field(data: &Value, key: &str) -> Option<Uuid> {
    data.get(key)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Derive the entity update for a job in a terminal state.
///
/// Returns `None` for job types with no downstream entity (reads, close)
/// and for jobs whose input lacks the target id.
pub fn propagation_for(job: &Job) -> Option<EntityUpdate> {
    let completed = match job.status {
        JobStatus::Completed => true,
        JobStatus::Failed => false,
        // Not terminal yet: nothing to propagate
        JobStatus::Pending | JobStatus::Claimed => return None,
    };

    match job.job_type {
        JobType::Compile => {
            let id = uuid_field(&job.input_data, "version_id")?;
            let status = if completed {
                VersionStatus::Compiled
            } else {
                VersionStatus::Failed
            };
            Some(EntityUpdate::Version { id, status })
        }
        JobType::Deploy | JobType::Run => {
            let id = uuid_field(&job.input_data, "deployment_id")?;
            let status = if completed {
                DeploymentStatus::Running
            } else {
                DeploymentStatus::Error
            };
            Some(EntityUpdate::Deployment { id, status })
        }
        JobType::Stop => {
            let id = uuid_field(&job.input_data, "deployment_id")?;
            let status = if completed {
                DeploymentStatus::Stopped
            } else {
                DeploymentStatus::Error
            };
            Some(EntityUpdate::Deployment { id, status })
        }
        JobType::Trade => {
            let id = uuid_field(&job.input_data, "signal_id")?;
            if completed {
                let output = job.output_data.as_ref();
                Some(EntityUpdate::Signal {
                    id,
                    status: SignalStatus::Executed,
                    fill_price: output
                        .and_then(|o| o.get("fill_price"))
                        .and_then(Value::as_f64),
                    broker_order_id: output
                        .and_then(|o| o.get("order_id"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error_message: None,
                })
            } else {
                Some(EntityUpdate::Signal {
                    id,
                    status: SignalStatus::Failed,
                    fill_price: None,
                    broker_order_id: None,
                    error_message: job.error_message.clone(),
                })
            }
        }
        JobType::ClosePosition
        | JobType::GetPositions
        | JobType::GetAccount
        | JobType::GetCandles => None,
    }
}
