//! fxbridge - trading platform backend and MetaTrader bridge agent
//!
//! The backend relays webhook signals and manual order requests into an
//! asynchronous job queue, streams live prices to browsers over WebSockets,
//! and manages paired desktop agents. The agent binary polls the backend for
//! jobs, executes them against a local trading terminal, and pushes ticks.

pub mod agent;
pub mod auth;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod core;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod sessions;
pub mod store;
pub mod ws;
