//! Trading terminal seam
//!
//! The real bridge talks to a locally running MetaTrader terminal; that FFI
//! is platform-bound, so the trait is the contract and the in-repo
//! implementation is a deterministic simulated terminal used for demos and
//! tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{AccountInfo, Candle, Position, PriceTick};

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("no price available for {0}")]
    NoPrice(String),
    #[error("position {0} not found")]
    PositionNotFound(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("terminal unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct TradeFill {
    pub fill_price: f64,
    pub ticket: String,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub closed_price: f64,
    pub pnl: f64,
}

#[async_trait]
pub trait TerminalBridge: Send + Sync {
    /// Instruments this terminal quotes
    fn symbols(&self) -> Vec<String>;

    async fn is_connected(&self) -> bool;

    async fn current_tick(&self, symbol: &str) -> Result<PriceTick, TerminalError>;

    async fn execute_trade(
        &self,
        symbol: &str,
        side: &str,
        volume: f64,
        sl_pips: Option<f64>,
        tp_pips: Option<f64>,
    ) -> Result<TradeFill, TerminalError>;

    async fn close_position(&self, ticket: &str) -> Result<ClosedPosition, TerminalError>;

    async fn positions(&self) -> Result<Vec<Position>, TerminalError>;

    async fn account(&self) -> Result<AccountInfo, TerminalError>;

    async fn candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, TerminalError>;

    /// Compile an EA source version on the terminal host
    async fn compile(&self, version_id: &str) -> Result<(), TerminalError>;

    /// Attach an EA to a chart; returns the chart id
    async fn deploy(&self, symbol: &str, timeframe: &str) -> Result<i64, TerminalError>;
}

/// Spread applied around the simulated mid price
const SIM_SPREAD: f64 = 0.0002;

struct OpenPosition {
    symbol: String,
    side: String,
    volume: f64,
    open_price: f64,
    sl: Option<f64>,
    tp: Option<f64>,
}

struct SimState {
    mids: HashMap<String, f64>,
    positions: HashMap<String, OpenPosition>,
    next_ticket: u64,
    balance: f64,
}

/// Deterministic-enough paper terminal: immediate fills at the current
/// quote, mid prices doing a small random walk.
pub struct SimTerminal {
    state: Mutex<SimState>,
}

impl SimTerminal {
    pub fn new() -> Self {
        let mids = [
            ("EURUSD", 1.0845),
            ("GBPUSD", 1.2710),
            ("XAUUSD", 2360.50),
            ("USDJPY", 151.30),
            ("AUDUSD", 0.6590),
            ("USDCAD", 1.3720),
        ]
        .into_iter()
        .map(|(s, p)| (s.to_string(), p))
        .collect();

        Self {
            state: Mutex::new(SimState {
                mids,
                positions: HashMap::new(),
                next_ticket: 1,
                balance: 10_000.0,
            }),
        }
    }

    fn quote(mid: f64) -> (f64, f64) {
        (mid - SIM_SPREAD / 2.0, mid + SIM_SPREAD / 2.0)
    }

    fn pip(symbol: &str) -> f64 {
        if symbol.ends_with("JPY") {
            0.01
        } else {
            0.0001
        }
    }

    fn timeframe_minutes(timeframe: &str) -> i64 {
        match timeframe {
            "M1" => 1,
            "M5" => 5,
            "M15" => 15,
            "H4" => 240,
            "D1" => 1440,
            _ => 60,
        }
    }
}

impl Default for SimTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBridge for SimTerminal {
    fn symbols(&self) -> Vec<String> {
        vec![
            "EURUSD".to_string(),
            "GBPUSD".to_string(),
            "XAUUSD".to_string(),
            "USDJPY".to_string(),
            "AUDUSD".to_string(),
            "USDCAD".to_string(),
        ]
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn current_tick(&self, symbol: &str) -> Result<PriceTick, TerminalError> {
        let mut state = self.state.lock().await;
        let mid = state
            .mids
            .get_mut(symbol)
            .ok_or_else(|| TerminalError::NoPrice(symbol.to_string()))?;

        // Small random walk so streams look alive
        let drift = rand::thread_rng().gen_range(-0.0003..0.0003);
        *mid *= 1.0 + drift;
        let (bid, ask) = Self::quote(*mid);

        Ok(PriceTick::new(symbol, bid, ask, Utc::now()))
    }

    async fn execute_trade(
        &self,
        symbol: &str,
        side: &str,
        volume: f64,
        sl_pips: Option<f64>,
        tp_pips: Option<f64>,
    ) -> Result<TradeFill, TerminalError> {
        if volume <= 0.0 {
            return Err(TerminalError::Rejected("volume must be positive".to_string()));
        }
        if side != "buy" && side != "sell" {
            return Err(TerminalError::Rejected(format!("unknown side {}", side)));
        }

        let mut state = self.state.lock().await;
        let mid = *state
            .mids
            .get(symbol)
            .ok_or_else(|| TerminalError::NoPrice(symbol.to_string()))?;
        let (bid, ask) = Self::quote(mid);
        let price = if side == "buy" { ask } else { bid };
        let pip = Self::pip(symbol);

        let sl = sl_pips.map(|pips| {
            if side == "buy" {
                price - pips * pip
            } else {
                price + pips * pip
            }
        });
        let tp = tp_pips.map(|pips| {
            if side == "buy" {
                price + pips * pip
            } else {
                price - pips * pip
            }
        });

        let ticket = state.next_ticket.to_string();
        state.next_ticket += 1;
        state.positions.insert(
            ticket.clone(),
            OpenPosition {
                symbol: symbol.to_string(),
                side: side.to_string(),
                volume,
                open_price: price,
                sl,
                tp,
            },
        );

        Ok(TradeFill {
            fill_price: price,
            order_id: ticket.clone(),
            ticket,
        })
    }

    async fn close_position(&self, ticket: &str) -> Result<ClosedPosition, TerminalError> {
        let mut state = self.state.lock().await;
        let position = state
            .positions
            .remove(ticket)
            .ok_or_else(|| TerminalError::PositionNotFound(ticket.to_string()))?;

        let mid = *state
            .mids
            .get(&position.symbol)
            .ok_or_else(|| TerminalError::NoPrice(position.symbol.clone()))?;
        let (bid, ask) = Self::quote(mid);
        // Closing a long sells at bid; closing a short buys at ask
        let close_price = if position.side == "buy" { bid } else { ask };
        let direction = if position.side == "buy" { 1.0 } else { -1.0 };
        let pnl = (close_price - position.open_price) * direction * position.volume * 100_000.0;

        state.balance += pnl;
        Ok(ClosedPosition {
            closed_price: close_price,
            pnl,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, TerminalError> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for (ticket, position) in &state.positions {
            let mid = state.mids.get(&position.symbol).copied().unwrap_or(position.open_price);
            let (bid, ask) = Self::quote(mid);
            let current = if position.side == "buy" { bid } else { ask };
            let direction = if position.side == "buy" { 1.0 } else { -1.0 };
            out.push(Position {
                id: ticket.clone(),
                ticket: ticket.clone(),
                symbol: position.symbol.clone(),
                side: position.side.clone(),
                volume: position.volume,
                open_price: position.open_price,
                current_price: current,
                sl: position.sl,
                tp: position.tp,
                pnl: (current - position.open_price) * direction * position.volume * 100_000.0,
            });
        }
        Ok(out)
    }

    async fn account(&self) -> Result<AccountInfo, TerminalError> {
        let state = self.state.lock().await;
        let margin_used: f64 = state.positions.values().map(|p| p.volume * 1000.0).sum();
        Ok(AccountInfo {
            balance: state.balance,
            equity: state.balance,
            margin_used,
            margin_available: (state.balance - margin_used).max(0.0),
            currency: "USD".to_string(),
            leverage: 100,
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, TerminalError> {
        let state = self.state.lock().await;
        let mid = *state
            .mids
            .get(symbol)
            .ok_or_else(|| TerminalError::NoPrice(symbol.to_string()))?;
        drop(state);

        let step = ChronoDuration::minutes(Self::timeframe_minutes(timeframe));
        let mut candles = Vec::with_capacity(count);
        let mut price = mid;
        let mut rng = rand::thread_rng();

        for i in (0..count).rev() {
            let time = Utc::now() - step * (i as i32);
            let open = price;
            let close = open * (1.0 + rng.gen_range(-0.001..0.001));
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.0005));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.0005));
            candles.push(Candle {
                time: time.to_rfc3339(),
                open,
                high,
                low,
                close,
                volume: rng.gen_range(500.0..1500.0),
            });
            price = close;
        }

        Ok(candles)
    }

    async fn compile(&self, _version_id: &str) -> Result<(), TerminalError> {
        Ok(())
    }

    async fn deploy(&self, symbol: &str, _timeframe: &str) -> Result<i64, TerminalError> {
        let state = self.state.lock().await;
        if !state.mids.contains_key(symbol) {
            return Err(TerminalError::NoPrice(symbol.to_string()));
        }
        Ok(1)
    }
}
