//! Normalized per-symbol snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trading session label carried on every snapshot. Session transitions
/// drive memo resets for new-extreme and opening-range detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Session {
    PreMarket,
    MarketOpen,
    PostMarket,
    Closed,
}

impl Session {
    pub fn parse(s: &str) -> Option<Session> {
        match s {
            "PRE_MARKET" => Some(Session::PreMarket),
            "MARKET_OPEN" => Some(Session::MarketOpen),
            "POST_MARKET" => Some(Session::PostMarket),
            "CLOSED" => Some(Session::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Session::PreMarket => "PRE_MARKET",
            Session::MarketOpen => "MARKET_OPEN",
            Session::PostMarket => "POST_MARKET",
            Session::Closed => "CLOSED",
        }
    }
}

/// The canonical per-symbol state at an instant.
///
/// A state update replaces its predecessor atomically (the engine caches
/// `Arc<TickerState>`); detectors see either the full old state or the full
/// new state, never a mix. Timestamps within a symbol are monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerState {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// Cumulative day volume.
    pub volume: i64,

    // Day aggregates
    pub open: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub prev_close: Option<f64>,
    pub vwap: Option<f64>,

    // Intraday extremes including pre/post market
    pub intraday_high: Option<f64>,
    pub intraday_low: Option<f64>,

    // Volatility / volume analytics
    pub atr: Option<f64>,
    pub atr_percent: Option<f64>,
    pub rvol: Option<f64>,

    // Trade-count statistics
    pub trades_today: Option<i64>,
    pub avg_trades_5d: Option<f64>,
    pub trades_z_score: Option<f64>,
    pub last_trade_size: Option<i64>,

    // Rolling-window readings
    pub chg_1min: Option<f64>,
    pub chg_5min: Option<f64>,
    pub chg_10min: Option<f64>,
    pub chg_15min: Option<f64>,
    pub chg_30min: Option<f64>,
    pub vol_1min: Option<i64>,
    pub vol_5min: Option<i64>,
    pub vol_10min: Option<i64>,
    pub vol_15min: Option<i64>,
    pub vol_30min: Option<i64>,
    pub price_5min_ago: Option<f64>,

    // 1-minute timeframe technicals
    pub rsi: Option<f64>,
    pub sma8: Option<f64>,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub adx: Option<f64>,

    // 5-minute timeframe technicals
    pub sma8_5m: Option<f64>,
    pub sma20_5m: Option<f64>,
    pub macd_5m: Option<f64>,
    pub macd_signal_5m: Option<f64>,
    pub macd_hist_5m: Option<f64>,
    pub stoch_k_5m: Option<f64>,
    pub stoch_d_5m: Option<f64>,

    // Daily timeframe
    pub sma20_daily: Option<f64>,
    pub sma50_daily: Option<f64>,
    pub sma200_daily: Option<f64>,
    /// Previous-day high, acts as resistance.
    pub daily_high: Option<f64>,
    /// Previous-day low, acts as support.
    pub daily_low: Option<f64>,

    // Fundamentals / classification
    pub market_cap: Option<f64>,
    pub float_shares: Option<f64>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub security_type: Option<String>,

    pub session: Session,

    // Opening-range boundaries, when the upstream has frozen them
    pub or_high: Option<f64>,
    pub or_low: Option<f64>,

    pub halted: bool,

    // Derived metrics (computed at normalization)
    pub change_percent: Option<f64>,
    pub gap_percent: Option<f64>,
    pub change_from_open: Option<f64>,
}

impl TickerState {
    /// Minimal state used as a base by the ingestor and by tests.
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            volume: 0,
            open: None,
            day_high: None,
            day_low: None,
            prev_close: None,
            vwap: None,
            intraday_high: None,
            intraday_low: None,
            atr: None,
            atr_percent: None,
            rvol: None,
            trades_today: None,
            avg_trades_5d: None,
            trades_z_score: None,
            last_trade_size: None,
            chg_1min: None,
            chg_5min: None,
            chg_10min: None,
            chg_15min: None,
            chg_30min: None,
            vol_1min: None,
            vol_5min: None,
            vol_10min: None,
            vol_15min: None,
            vol_30min: None,
            price_5min_ago: None,
            rsi: None,
            sma8: None,
            sma20: None,
            sma50: None,
            sma200: None,
            ema_20: None,
            ema_50: None,
            macd: None,
            macd_signal: None,
            macd_hist: None,
            bb_upper: None,
            bb_middle: None,
            bb_lower: None,
            stoch_k: None,
            stoch_d: None,
            adx: None,
            sma8_5m: None,
            sma20_5m: None,
            macd_5m: None,
            macd_signal_5m: None,
            macd_hist_5m: None,
            stoch_k_5m: None,
            stoch_d_5m: None,
            sma20_daily: None,
            sma50_daily: None,
            sma200_daily: None,
            daily_high: None,
            daily_low: None,
            market_cap: None,
            float_shares: None,
            sector: None,
            industry: None,
            security_type: None,
            session: Session::MarketOpen,
            or_high: None,
            or_low: None,
            halted: false,
            change_percent: None,
            gap_percent: None,
            change_from_open: None,
        }
    }

    /// Recompute `change_percent`, `gap_percent` and `change_from_open`.
    ///
    /// `gap_percent` follows the registry convention: the real gap
    /// `(open - prev_close) / prev_close` when an open exists, otherwise the
    /// expected gap (current change vs previous close) during pre-market.
    pub fn compute_derived(&mut self) {
        self.change_percent = None;
        self.gap_percent = None;
        self.change_from_open = None;

        if self.price <= 0.0 {
            return;
        }
        if let Some(prev_close) = self.prev_close.filter(|v| *v > 0.0) {
            let change = (self.price - prev_close) / prev_close * 100.0;
            self.change_percent = Some(change);
            match self.open.filter(|v| *v > 0.0) {
                Some(open) => self.gap_percent = Some((open - prev_close) / prev_close * 100.0),
                None => self.gap_percent = Some(change),
            }
        }
        if let Some(open) = self.open.filter(|v| *v > 0.0) {
            self.change_from_open = Some((self.price - open) / open * 100.0);
        }
    }

    /// Unix seconds of the state timestamp.
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_parse() {
        assert_eq!(Session::parse("PRE_MARKET"), Some(Session::PreMarket));
        assert_eq!(Session::parse("MARKET_OPEN"), Some(Session::MarketOpen));
        assert_eq!(Session::parse("lunch"), None);
        assert_eq!(Session::PostMarket.as_str(), "POST_MARKET");
    }

    #[test]
    fn test_derived_metrics_with_open() {
        let mut state = TickerState::new("AAPL", Utc::now(), 102.0);
        state.open = Some(101.0);
        state.prev_close = Some(100.0);
        state.compute_derived();
        assert!((state.change_percent.unwrap() - 2.0).abs() < 1e-9);
        assert!((state.gap_percent.unwrap() - 1.0).abs() < 1e-9);
        assert!((state.change_from_open.unwrap() - 0.990099).abs() < 1e-4);
    }

    #[test]
    fn test_derived_metrics_premarket_gap_falls_back_to_change() {
        let mut state = TickerState::new("AAPL", Utc::now(), 105.0);
        state.prev_close = Some(100.0);
        state.compute_derived();
        assert!((state.gap_percent.unwrap() - 5.0).abs() < 1e-9);
        assert!(state.change_from_open.is_none());
    }
}
