//! WebSocket fan-out for live prices
//!
//! One process-wide subscription to the tick pub/sub feeds any number of
//! browser sockets. The registry maps instruments to outbound channels; the
//! socket tasks own their sockets, so registration and broadcast never touch
//! a socket from two contexts.

use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::cache::TickCache;
use crate::models::PriceTick;

/// Initial reconnect delay for the pub/sub subscriber
const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling
const RECONNECT_CAP: Duration = Duration::from_secs(30);

pub type SocketId = u64;

/// Render a tick as the wire event browsers receive
pub fn tick_event(tick: &PriceTick) -> String {
    json!({
        "type": "tick",
        "data": {
            "instrument": tick.instrument,
            "bid": tick.bid,
            "ask": tick.ask,
            "time": tick.time,
        }
    })
    .to_string()
}

/// Registry of live sockets per instrument.
///
/// Sockets are represented by their outbound channel; a failed send means
/// the owning task is gone and only that socket is removed.
pub struct PriceFanout {
    connections: RwLock<HashMap<String, HashMap<SocketId, mpsc::UnboundedSender<String>>>>,
    next_id: AtomicU64,
}

impl PriceFanout {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a socket for an instrument; the receiver is the socket's
    /// outbound queue.
    pub async fn register(&self, instrument: &str) -> (SocketId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .entry(instrument.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    pub async fn deregister(&self, instrument: &str, id: SocketId) {
        let mut connections = self.connections.write().await;
        if let Some(sockets) = connections.get_mut(instrument) {
            sockets.remove(&id);
            if sockets.is_empty() {
                connections.remove(instrument);
            }
        }
    }

    /// Deliver a tick to every socket subscribed to its instrument.
    /// Returns the number of sockets reached.
    pub async fn broadcast(&self, tick: &PriceTick) -> usize {
        let payload = tick_event(tick);

        let mut dead = Vec::new();
        let delivered = {
            let connections = self.connections.read().await;
            let Some(sockets) = connections.get(&tick.instrument) else {
                return 0;
            };
            let mut delivered = 0;
            for (&id, tx) in sockets.iter() {
                if tx.send(payload.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(id);
                }
            }
            delivered
        };

        if !dead.is_empty() {
            let mut connections = self.connections.write().await;
            if let Some(sockets) = connections.get_mut(&tick.instrument) {
                for id in dead {
                    sockets.remove(&id);
                }
                if sockets.is_empty() {
                    connections.remove(&tick.instrument);
                }
            }
        }

        delivered
    }

    pub async fn client_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(HashMap::len)
            .sum()
    }
}

impl Default for PriceFanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges the tick pub/sub to the fan-out registry.
///
/// Runs as a single long-lived task per process; reconnects with
/// exponential backoff and drops the subscription cleanly on stop.
pub struct PriceStreamBridge {
    cache: Arc<dyn TickCache>,
    fanout: Arc<PriceFanout>,
    shutdown: watch::Sender<bool>,
    handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl PriceStreamBridge {
    pub fn new(cache: Arc<dyn TickCache>, fanout: Arc<PriceFanout>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cache,
            fanout,
            shutdown,
            handle: RwLock::new(None),
        }
    }

    pub async fn start(&self) {
        let cache = self.cache.clone();
        let fanout = self.fanout.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut delay = RECONNECT_BASE;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let mut stream = match cache.subscribe_ticks().await {
                    Ok(stream) => {
                        info!("Tick subscriber connected");
                        delay = RECONNECT_BASE;
                        stream
                    }
                    Err(e) => {
                        warn!(error = %e, "Tick subscriber failed, reconnecting in {:?}", delay);
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                        delay = (delay * 2).min(RECONNECT_CAP);
                        continue;
                    }
                };

                loop {
                    tokio::select! {
                        next = stream.next() => {
                            match next {
                                Some(tick) => {
                                    let delivered = fanout.broadcast(&tick).await;
                                    debug!(
                                        instrument = %tick.instrument,
                                        delivered = delivered,
                                        "Tick fanned out"
                                    );
                                }
                                // Stream ended: transport dropped, go reconnect
                                None => {
                                    warn!("Tick subscription ended, reconnecting");
                                    break;
                                }
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            // Returning drops the stream, which tears down
                            // the subscription before the task exits
                            info!("Tick subscriber stopped");
                            return;
                        }
                    }
                }
            }
        });

        let mut h = self.handle.write().await;
        *h = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle.write().await;
        if let Some(h) = handle.take() {
            let _ = h.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        let handle = self.handle.read().await;
        handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}
