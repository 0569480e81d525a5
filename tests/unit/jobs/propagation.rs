//! Unit tests for job-result propagation mapping

use chrono::Utc;
use fxbridge::jobs::propagation::{propagation_for, EntityUpdate};
use fxbridge::models::{
    DeploymentStatus, Job, JobStatus, JobType, SignalStatus, VersionStatus,
};
use serde_json::json;
use uuid::Uuid;

fn job(job_type: JobType, status: JobStatus, input: serde_json::Value) -> Job {
    Job {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        job_type,
        status,
        input_data: input,
        output_data: None,
        error_message: None,
        created_at: Utc::now(),
        claimed_at: None,
        completed_at: None,
        claimed_by: None,
    }
}

#[test]
fn completed_compile_marks_version_compiled() {
    let version_id = Uuid::new_v4();
    let job = job(
        JobType::Compile,
        JobStatus::Completed,
        json!({ "version_id": version_id }),
    );
    assert_eq!(
        propagation_for(&job),
        Some(EntityUpdate::Version {
            id: version_id,
            status: VersionStatus::Compiled,
        })
    );
}

#[test]
fn failed_compile_marks_version_failed() {
    let version_id = Uuid::new_v4();
    let job = job(
        JobType::Compile,
        JobStatus::Failed,
        json!({ "version_id": version_id }),
    );
    assert_eq!(
        propagation_for(&job),
        Some(EntityUpdate::Version {
            id: version_id,
            status: VersionStatus::Failed,
        })
    );
}

#[test]
fn deploy_and_run_map_to_running_or_error() {
    let deployment_id = Uuid::new_v4();
    for job_type in [JobType::Deploy, JobType::Run] {
        let ok = job(
            job_type,
            JobStatus::Completed,
            json!({ "deployment_id": deployment_id }),
        );
        assert_eq!(
            propagation_for(&ok),
            Some(EntityUpdate::Deployment {
                id: deployment_id,
                status: DeploymentStatus::Running,
            })
        );

        let bad = job(
            job_type,
            JobStatus::Failed,
            json!({ "deployment_id": deployment_id }),
        );
        assert_eq!(
            propagation_for(&bad),
            Some(EntityUpdate::Deployment {
                id: deployment_id,
                status: DeploymentStatus::Error,
            })
        );
    }
}

#[test]
fn completed_stop_marks_deployment_stopped() {
    let deployment_id = Uuid::new_v4();
    let job = job(
        JobType::Stop,
        JobStatus::Completed,
        json!({ "deployment_id": deployment_id }),
    );
    assert_eq!(
        propagation_for(&job),
        Some(EntityUpdate::Deployment {
            id: deployment_id,
            status: DeploymentStatus::Stopped,
        })
    );
}

#[test]
fn completed_trade_carries_fill_into_signal() {
    let signal_id = Uuid::new_v4();
    let mut trade = job(
        JobType::Trade,
        JobStatus::Completed,
        json!({ "signal_id": signal_id, "symbol": "EURUSD" }),
    );
    trade.output_data = Some(json!({ "fill_price": 1.0845, "order_id": "123" }));

    assert_eq!(
        propagation_for(&trade),
        Some(EntityUpdate::Signal {
            id: signal_id,
            status: SignalStatus::Executed,
            fill_price: Some(1.0845),
            broker_order_id: Some("123".to_string()),
            error_message: None,
        })
    );
}

#[test]
fn failed_trade_carries_error_into_signal() {
    let signal_id = Uuid::new_v4();
    let mut trade = job(
        JobType::Trade,
        JobStatus::Failed,
        json!({ "signal_id": signal_id }),
    );
    trade.error_message = Some("no price".to_string());

    assert_eq!(
        propagation_for(&trade),
        Some(EntityUpdate::Signal {
            id: signal_id,
            status: SignalStatus::Failed,
            fill_price: None,
            broker_order_id: None,
            error_message: Some("no price".to_string()),
        })
    );
}

#[test]
fn manual_trade_without_signal_id_propagates_nothing() {
    let trade = job(
        JobType::Trade,
        JobStatus::Completed,
        json!({ "symbol": "EURUSD" }),
    );
    assert_eq!(propagation_for(&trade), None);
}

#[test]
fn reads_propagate_nothing() {
    for job_type in [
        JobType::GetPositions,
        JobType::GetAccount,
        JobType::GetCandles,
        JobType::ClosePosition,
    ] {
        let done = job(job_type, JobStatus::Completed, json!({}));
        assert_eq!(propagation_for(&done), None);
    }
}

#[test]
fn non_terminal_jobs_propagate_nothing() {
    let version_id = Uuid::new_v4();
    for status in [JobStatus::Pending, JobStatus::Claimed] {
        let pending = job(
            JobType::Compile,
            status,
            json!({ "version_id": version_id }),
        );
        assert_eq!(propagation_for(&pending), None);
    }
}

#[test]
fn mapping_is_pure_and_repeatable() {
    let signal_id = Uuid::new_v4();
    let mut trade = job(
        JobType::Trade,
        JobStatus::Completed,
        json!({ "signal_id": signal_id }),
    );
    trade.output_data = Some(json!({ "fill_price": 1.1, "order_id": "7" }));

    // Same job, same update: reapplying cannot double-apply
    assert_eq!(propagation_for(&trade), propagation_for(&trade));
}
