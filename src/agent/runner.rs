//! Agent runtime: the three loops and the job executor

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::models::{JobResult, JobStatus, JobType};

use super::client::{ApiClient, ClaimedJob, ClientError, QuotePush};
use super::terminal::TerminalBridge;

/// Price push cadence
const PRICE_INTERVAL: Duration = Duration::from_secs(1);
/// Heartbeat cadence
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
/// Job poll cadence
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct AgentRuntime {
    client: Arc<ApiClient>,
    terminal: Arc<dyn TerminalBridge>,
    jobs_processed: Arc<AtomicU64>,
}

impl AgentRuntime {
    pub fn new(client: Arc<ApiClient>, terminal: Arc<dyn TerminalBridge>) -> Self {
        Self {
            client,
            terminal,
            jobs_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the price, heartbeat, and job loops.
    ///
    /// Each loop is independent so a slow job execution cannot starve price
    /// delivery or heartbeats. Any loop hitting a credential rejection ends
    /// the runtime via the returned handles.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_price_loop(),
            self.spawn_heartbeat_loop(),
            self.spawn_job_loop(),
        ]
    }

    fn spawn_price_loop(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let terminal = self.terminal.clone();

        tokio::spawn(async move {
            let mut tick = interval(PRICE_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                let mut quotes = HashMap::new();
                for symbol in terminal.symbols() {
                    match terminal.current_tick(&symbol).await {
                        Ok(t) => {
                            quotes.insert(
                                symbol,
                                QuotePush {
                                    bid: t.bid,
                                    ask: t.ask,
                                    time: t.time,
                                },
                            );
                        }
                        Err(e) => debug!(symbol = %symbol, error = %e, "No quote this round"),
                    }
                }

                if quotes.is_empty() {
                    continue;
                }

                match client.push_prices(&quotes).await {
                    Ok(received) => debug!(received = received, "Prices pushed"),
                    Err(ClientError::Unauthorized) => {
                        error!("Invalid pairing key - please re-pair this agent");
                        return;
                    }
                    Err(e) => debug!(error = %e, "Price push failed"),
                }
            }
        })
    }

    fn spawn_heartbeat_loop(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let terminal = self.terminal.clone();
        let jobs_processed = self.jobs_processed.clone();

        tokio::spawn(async move {
            let mut tick = interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                let metrics = json!({
                    "terminal_connected": terminal.is_connected().await,
                    "symbols_tracked": terminal.symbols().len(),
                    "jobs_processed": jobs_processed.load(Ordering::Relaxed),
                });

                match client.heartbeat("online", metrics).await {
                    Ok(()) => info!(
                        jobs = jobs_processed.load(Ordering::Relaxed),
                        "Heartbeat sent"
                    ),
                    Err(ClientError::Unauthorized) => {
                        error!("Invalid pairing key - please re-pair this agent");
                        return;
                    }
                    Err(e) => warn!(error = %e, "Heartbeat failed"),
                }
            }
        })
    }

    fn spawn_job_loop(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let terminal = self.terminal.clone();
        let jobs_processed = self.jobs_processed.clone();

        tokio::spawn(async move {
            let mut tick = interval(JOB_POLL_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                // Drain the queue each round
                loop {
                    let job = match client.next_job().await {
                        Ok(Some(job)) => job,
                        Ok(None) => break,
                        Err(ClientError::Unauthorized) => {
                            error!("Invalid pairing key - please re-pair this agent");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Job poll failed");
                            break;
                        }
                    };

                    info!(job_id = %job.job_id, job_type = job.job_type.as_str(), "Job claimed");
                    let result = execute_job(terminal.as_ref(), &job).await;
                    jobs_processed.fetch_add(1, Ordering::Relaxed);

                    match client.submit_result(job.job_id, &result).await {
                        Ok(()) => {
                            info!(job_id = %job.job_id, status = result.status.as_str(), "Job result posted")
                        }
                        Err(ClientError::Unauthorized) => {
                            error!("Invalid pairing key - please re-pair this agent");
                            return;
                        }
                        Err(e) => error!(job_id = %job.job_id, error = %e, "Result post failed"),
                    }
                }
            }
        })
    }
}

fn completed(output: Value) -> JobResult {
    JobResult {
        status: JobStatus::Completed,
        output_data: Some(output),
        error_message: None,
    }
}

fn failed(message: String) -> JobResult {
    JobResult {
        status: JobStatus::Failed,
        output_data: None,
        error_message: Some(message),
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Execute one claimed job against the terminal.
/// Failures become `failed` results carrying the reason; they are reported,
/// never swallowed.
pub async fn execute_job(terminal: &dyn TerminalBridge, job: &ClaimedJob) -> JobResult {
    let input = &job.input_data;

    match job.job_type {
        JobType::Trade => {
            let Some(symbol) = str_field(input, "symbol") else {
                return failed("trade job missing symbol".to_string());
            };
            let Some(side) = str_field(input, "side") else {
                return failed("trade job missing side".to_string());
            };
            let volume = input.get("volume").and_then(Value::as_f64).unwrap_or(0.0);
            let sl_pips = input.get("sl_pips").and_then(Value::as_f64);
            let tp_pips = input.get("tp_pips").and_then(Value::as_f64);

            match terminal
                .execute_trade(symbol, side, volume, sl_pips, tp_pips)
                .await
            {
                Ok(fill) => completed(json!({
                    "fill_price": fill.fill_price,
                    "ticket": fill.ticket,
                    "order_id": fill.order_id,
                })),
                Err(e) => failed(e.to_string()),
            }
        }
        JobType::ClosePosition => {
            let Some(ticket) = str_field(input, "ticket") else {
                return failed("close job missing ticket".to_string());
            };
            match terminal.close_position(ticket).await {
                Ok(closed) => completed(json!({
                    "closed_price": closed.closed_price,
                    "pnl": closed.pnl,
                })),
                Err(e) => failed(e.to_string()),
            }
        }
        JobType::GetPositions => match terminal.positions().await {
            Ok(positions) => completed(json!({ "positions": positions })),
            Err(e) => failed(e.to_string()),
        },
        JobType::GetAccount => match terminal.account().await {
            Ok(account) => match serde_json::to_value(&account) {
                Ok(value) => completed(value),
                Err(e) => failed(e.to_string()),
            },
            Err(e) => failed(e.to_string()),
        },
        JobType::GetCandles => {
            let Some(symbol) = str_field(input, "symbol") else {
                return failed("candle job missing symbol".to_string());
            };
            let timeframe = str_field(input, "timeframe").unwrap_or("H1");
            let count = input
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(200) as usize;

            match terminal.candles(symbol, timeframe, count).await {
                Ok(candles) => completed(json!({ "candles": candles })),
                Err(e) => failed(e.to_string()),
            }
        }
        JobType::Compile => {
            let Some(version_id) = str_field(input, "version_id") else {
                return failed("compile job missing version_id".to_string());
            };
            match terminal.compile(version_id).await {
                Ok(()) => completed(json!({ "compiled": true })),
                Err(e) => failed(e.to_string()),
            }
        }
        JobType::Deploy => {
            let symbol = str_field(input, "symbol").unwrap_or("EURUSD");
            let timeframe = str_field(input, "timeframe").unwrap_or("H1");
            match terminal.deploy(symbol, timeframe).await {
                Ok(chart_id) => completed(json!({ "deployed": true, "chart_id": chart_id })),
                Err(e) => failed(e.to_string()),
            }
        }
        JobType::Run => completed(json!({ "running": true })),
        JobType::Stop => completed(json!({ "stopped": true })),
    }
}
