//! Prometheus metrics for the API server

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    pub http_requests_total: IntCounter,
    pub http_request_duration_seconds: Histogram,
    pub http_requests_in_flight: Gauge,

    pub jobs_enqueued_total: IntCounter,
    pub jobs_claimed_total: IntCounter,
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub bridge_timeouts_total: IntCounter,

    pub ticks_received_total: IntCounter,
    pub ws_clients_connected: Gauge,

    pub database_connected: Gauge,
    pub cache_connected: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounter::with_opts(Opts::new(
            "http_requests_total",
            "Total HTTP requests handled",
        ))?;
        let http_request_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        ))?;
        let http_requests_in_flight = Gauge::with_opts(Opts::new(
            "http_requests_in_flight",
            "HTTP requests currently being handled",
        ))?;

        let jobs_enqueued_total =
            IntCounter::with_opts(Opts::new("jobs_enqueued_total", "Jobs enqueued"))?;
        let jobs_claimed_total =
            IntCounter::with_opts(Opts::new("jobs_claimed_total", "Jobs claimed by agents"))?;
        let jobs_completed_total =
            IntCounter::with_opts(Opts::new("jobs_completed_total", "Jobs reported completed"))?;
        let jobs_failed_total =
            IntCounter::with_opts(Opts::new("jobs_failed_total", "Jobs reported failed"))?;
        let bridge_timeouts_total = IntCounter::with_opts(Opts::new(
            "bridge_timeouts_total",
            "Synchronous waits that hit their deadline",
        ))?;

        let ticks_received_total =
            IntCounter::with_opts(Opts::new("ticks_received_total", "Price ticks received"))?;
        let ws_clients_connected = Gauge::with_opts(Opts::new(
            "ws_clients_connected",
            "WebSocket clients currently connected",
        ))?;

        let database_connected = Gauge::with_opts(Opts::new(
            "database_connected",
            "1 when the relational store is reachable",
        ))?;
        let cache_connected = Gauge::with_opts(Opts::new(
            "cache_connected",
            "1 when the cache/pub-sub backend is reachable",
        ))?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(jobs_enqueued_total.clone()))?;
        registry.register(Box::new(jobs_claimed_total.clone()))?;
        registry.register(Box::new(jobs_completed_total.clone()))?;
        registry.register(Box::new(jobs_failed_total.clone()))?;
        registry.register(Box::new(bridge_timeouts_total.clone()))?;
        registry.register(Box::new(ticks_received_total.clone()))?;
        registry.register(Box::new(ws_clients_connected.clone()))?;
        registry.register(Box::new(database_connected.clone()))?;
        registry.register(Box::new(cache_connected.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            jobs_enqueued_total,
            jobs_claimed_total,
            jobs_completed_total,
            jobs_failed_total,
            bridge_timeouts_total,
            ticks_received_total,
            ws_clients_connected,
            database_connected,
            cache_connected,
        })
    }

    /// Render all registered metrics in the Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
