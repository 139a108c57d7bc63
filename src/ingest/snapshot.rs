//! Upstream enriched snapshot: the raw per-symbol field bag.
//!
//! The upstream broadcasts one field bag per symbol per tick, mixing vendor
//! quote aggregates with pre-computed analytics. Roughly ninety fields are
//! possible; this module defines the canonical extraction for the ones
//! detection cares about. Unknown fields are preserved in `extra` and travel
//! to the writer's `context` payload untouched.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{Session, TickerState};

/// OHLCV aggregate (`day`, `prevDay`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregate {
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<i64>,
    pub vw: Option<f64>,
}

/// Current-minute aggregate; `av` is the accumulated day volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinuteAggregate {
    pub av: Option<i64>,
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<i64>,
    pub vw: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastTrade {
    /// Trade price.
    pub p: Option<f64>,
    /// Trade size.
    pub s: Option<i64>,
    /// Trade timestamp, Unix milliseconds.
    pub t: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastQuote {
    /// Bid price.
    pub bp: Option<f64>,
    /// Ask price.
    pub ap: Option<f64>,
}

/// The upstream field bag for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichedSnapshot {
    #[serde(default, alias = "ticker")]
    pub symbol: Option<String>,

    /// Snapshot time, Unix seconds. Falls back to `lastTrade.t`.
    #[serde(default)]
    pub timestamp: Option<i64>,

    #[serde(default)]
    pub day: Option<Aggregate>,
    #[serde(default, rename = "prevDay")]
    pub prev_day: Option<Aggregate>,
    #[serde(default)]
    pub min: Option<MinuteAggregate>,
    #[serde(default, rename = "lastTrade")]
    pub last_trade: Option<LastTrade>,
    #[serde(default, rename = "lastQuote")]
    pub last_quote: Option<LastQuote>,

    // Analytics enrichment
    #[serde(default)]
    pub vwap: Option<f64>,
    #[serde(default)]
    pub rvol: Option<f64>,
    #[serde(default)]
    pub atr: Option<f64>,
    #[serde(default)]
    pub atr_percent: Option<f64>,
    #[serde(default)]
    pub intraday_high: Option<f64>,
    #[serde(default)]
    pub intraday_low: Option<f64>,
    #[serde(default)]
    pub trades_today: Option<i64>,
    #[serde(default)]
    pub avg_trades_5d: Option<f64>,
    #[serde(default)]
    pub trades_z_score: Option<f64>,

    #[serde(default)]
    pub chg_1min: Option<f64>,
    #[serde(default)]
    pub chg_5min: Option<f64>,
    #[serde(default)]
    pub chg_10min: Option<f64>,
    #[serde(default)]
    pub chg_15min: Option<f64>,
    #[serde(default)]
    pub chg_30min: Option<f64>,
    #[serde(default)]
    pub vol_1min: Option<i64>,
    #[serde(default)]
    pub vol_5min: Option<i64>,
    #[serde(default)]
    pub vol_10min: Option<i64>,
    #[serde(default)]
    pub vol_15min: Option<i64>,
    #[serde(default)]
    pub vol_30min: Option<i64>,
    #[serde(default)]
    pub price_5min_ago: Option<f64>,

    // 1-minute technicals
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub sma8: Option<f64>,
    #[serde(default)]
    pub sma20: Option<f64>,
    #[serde(default)]
    pub sma50: Option<f64>,
    #[serde(default)]
    pub sma200: Option<f64>,
    #[serde(default)]
    pub ema_20: Option<f64>,
    #[serde(default)]
    pub ema_50: Option<f64>,
    #[serde(default)]
    pub macd: Option<f64>,
    #[serde(default)]
    pub macd_signal: Option<f64>,
    #[serde(default)]
    pub macd_hist: Option<f64>,
    #[serde(default)]
    pub bb_upper: Option<f64>,
    #[serde(default)]
    pub bb_middle: Option<f64>,
    #[serde(default)]
    pub bb_lower: Option<f64>,
    #[serde(default)]
    pub stoch_k: Option<f64>,
    #[serde(default)]
    pub stoch_d: Option<f64>,
    #[serde(default)]
    pub adx: Option<f64>,

    // 5-minute technicals
    #[serde(default)]
    pub sma8_5m: Option<f64>,
    #[serde(default)]
    pub sma20_5m: Option<f64>,
    #[serde(default)]
    pub macd_5m: Option<f64>,
    #[serde(default)]
    pub macd_signal_5m: Option<f64>,
    #[serde(default)]
    pub macd_hist_5m: Option<f64>,
    #[serde(default)]
    pub stoch_k_5m: Option<f64>,
    #[serde(default)]
    pub stoch_d_5m: Option<f64>,

    // Daily timeframe
    #[serde(default)]
    pub sma20_daily: Option<f64>,
    #[serde(default)]
    pub sma50_daily: Option<f64>,
    #[serde(default)]
    pub sma200_daily: Option<f64>,

    // Fundamentals / classification
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub float_shares: Option<f64>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub security_type: Option<String>,

    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub or_high: Option<f64>,
    #[serde(default)]
    pub or_low: Option<f64>,
    #[serde(default)]
    pub halted: Option<bool>,

    /// Everything the schema above does not name. Ignored for detection,
    /// preserved into the writer's context payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnrichedSnapshot {
    /// Canonical price extraction: `lastTrade.p -> day.c -> prevDay.c`.
    pub fn price(&self) -> Option<f64> {
        let candidates = [
            self.last_trade.as_ref().and_then(|t| t.p),
            self.day.as_ref().and_then(|d| d.c),
            self.prev_day.as_ref().and_then(|d| d.c),
        ];
        candidates.into_iter().flatten().find(|p| *p > 0.0)
    }

    /// Canonical volume extraction: `min.av -> day.v -> 0`.
    pub fn cumulative_volume(&self) -> i64 {
        self.min
            .as_ref()
            .and_then(|m| m.av)
            .or_else(|| self.day.as_ref().and_then(|d| d.v))
            .unwrap_or(0)
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        if let Some(secs) = self.timestamp {
            if let Some(ts) = Utc.timestamp_opt(secs, 0).single() {
                return ts;
            }
        }
        if let Some(ms) = self.last_trade.as_ref().and_then(|t| t.t) {
            if let Some(ts) = Utc.timestamp_millis_opt(ms).single() {
                return ts;
            }
        }
        Utc::now()
    }

    /// Normalize into a `TickerState`. Returns None for invalid rows
    /// (missing symbol, no positive price under any known path).
    pub fn normalize(&self, symbol_hint: Option<&str>) -> Option<TickerState> {
        let symbol = self
            .symbol
            .as_deref()
            .or(symbol_hint)
            .filter(|s| !s.is_empty())?
            .to_uppercase();
        let price = self.price()?;

        let mut state = TickerState::new(symbol, self.event_time(), price);
        state.volume = self.cumulative_volume();

        if let Some(day) = &self.day {
            state.open = day.o.filter(|v| *v > 0.0);
            state.day_high = day.h;
            state.day_low = day.l;
        }
        if let Some(prev) = &self.prev_day {
            state.prev_close = prev.c.filter(|v| *v > 0.0);
            state.daily_high = prev.h;
            state.daily_low = prev.l;
        }
        state.vwap = self.vwap.or_else(|| self.day.as_ref().and_then(|d| d.vw));
        state.last_trade_size = self.last_trade.as_ref().and_then(|t| t.s);

        state.intraday_high = self.intraday_high.or(state.day_high);
        state.intraday_low = self.intraday_low.or(state.day_low);

        state.atr = self.atr;
        state.atr_percent = self.atr_percent;
        state.rvol = self.rvol;
        state.trades_today = self.trades_today;
        state.avg_trades_5d = self.avg_trades_5d;
        state.trades_z_score = self.trades_z_score;

        state.chg_1min = self.chg_1min;
        state.chg_5min = self.chg_5min;
        state.chg_10min = self.chg_10min;
        state.chg_15min = self.chg_15min;
        state.chg_30min = self.chg_30min;
        state.vol_1min = self.vol_1min;
        state.vol_5min = self.vol_5min;
        state.vol_10min = self.vol_10min;
        state.vol_15min = self.vol_15min;
        state.vol_30min = self.vol_30min;
        state.price_5min_ago = self.price_5min_ago;

        state.rsi = self.rsi;
        state.sma8 = self.sma8;
        state.sma20 = self.sma20;
        state.sma50 = self.sma50;
        state.sma200 = self.sma200;
        state.ema_20 = self.ema_20;
        state.ema_50 = self.ema_50;
        state.macd = self.macd;
        state.macd_signal = self.macd_signal;
        state.macd_hist = self.macd_hist;
        state.bb_upper = self.bb_upper;
        state.bb_middle = self.bb_middle;
        state.bb_lower = self.bb_lower;
        state.stoch_k = self.stoch_k;
        state.stoch_d = self.stoch_d;
        state.adx = self.adx;

        state.sma8_5m = self.sma8_5m;
        state.sma20_5m = self.sma20_5m;
        state.macd_5m = self.macd_5m;
        state.macd_signal_5m = self.macd_signal_5m;
        state.macd_hist_5m = self.macd_hist_5m;
        state.stoch_k_5m = self.stoch_k_5m;
        state.stoch_d_5m = self.stoch_d_5m;

        state.sma20_daily = self.sma20_daily;
        state.sma50_daily = self.sma50_daily;
        state.sma200_daily = self.sma200_daily;

        state.market_cap = self.market_cap;
        state.float_shares = self.float_shares;
        state.sector = self.sector.clone();
        state.industry = self.industry.clone();
        state.security_type = self.security_type.clone();

        state.session = self
            .session
            .as_deref()
            .and_then(Session::parse)
            .unwrap_or(Session::MarketOpen);
        state.or_high = self.or_high;
        state.or_low = self.or_low;
        state.halted = self.halted.unwrap_or(false);

        state.compute_derived();
        Some(state)
    }

    /// JSON payload for the writer's `context` column: every field with a
    /// value, minus the large nested aggregates already summarized by the
    /// scalar columns.
    pub fn context_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                for key in ["day", "prevDay", "min", "lastTrade", "lastQuote"] {
                    map.remove(key);
                }
                map.retain(|_, v| !v.is_null());
                Value::Object(map)
            }
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "ticker": "aapl",
            "timestamp": 1700000000,
            "day": {"o": 184.0, "h": 186.0, "l": 183.5, "c": 185.2, "v": 1200000},
            "prevDay": {"o": 180.0, "h": 184.5, "l": 179.0, "c": 183.0, "v": 900000},
            "min": {"av": 1250000, "c": 185.2},
            "lastTrade": {"p": 185.25, "s": 300, "t": 1700000000123},
            "vwap": 184.9,
            "rvol": 1.7,
            "session": "MARKET_OPEN",
            "some_vendor_field": 42
        }"#
    }

    #[test]
    fn test_price_fallback_chain() {
        let snap: EnrichedSnapshot = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(snap.price(), Some(185.25));

        let mut no_trade = snap.clone();
        no_trade.last_trade = None;
        assert_eq!(no_trade.price(), Some(185.2));

        let mut prev_only = no_trade.clone();
        prev_only.day = None;
        assert_eq!(prev_only.price(), Some(183.0));
    }

    #[test]
    fn test_volume_fallback_chain() {
        let snap: EnrichedSnapshot = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(snap.cumulative_volume(), 1_250_000);
        let mut no_min = snap.clone();
        no_min.min = None;
        assert_eq!(no_min.cumulative_volume(), 1_200_000);
        no_min.day = None;
        assert_eq!(no_min.cumulative_volume(), 0);
    }

    #[test]
    fn test_normalize_builds_state() {
        let snap: EnrichedSnapshot = serde_json::from_str(sample_json()).unwrap();
        let state = snap.normalize(None).unwrap();
        assert_eq!(state.symbol, "AAPL");
        assert_eq!(state.volume, 1_250_000);
        assert_eq!(state.prev_close, Some(183.0));
        assert_eq!(state.daily_high, Some(184.5));
        assert_eq!(state.session, Session::MarketOpen);
        assert_eq!(state.unix_seconds(), 1_700_000_000);
        // gap = (184.0 - 183.0) / 183.0
        assert!((state.gap_percent.unwrap() - 0.5464).abs() < 1e-3);
    }

    #[test]
    fn test_normalize_rejects_invalid_rows() {
        let empty = EnrichedSnapshot::default();
        assert!(empty.normalize(None).is_none(), "no symbol");
        assert!(empty.normalize(Some("XYZ")).is_none(), "no price path");

        let mut negative = EnrichedSnapshot::default();
        negative.last_trade = Some(LastTrade {
            p: Some(-1.0),
            s: None,
            t: None,
        });
        assert!(negative.normalize(Some("XYZ")).is_none());
    }

    #[test]
    fn test_unknown_fields_survive_into_context() {
        let snap: EnrichedSnapshot = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(snap.extra.get("some_vendor_field"), Some(&Value::from(42)));
        let ctx = snap.context_value();
        assert_eq!(ctx.get("some_vendor_field"), Some(&Value::from(42)));
        assert!(ctx.get("day").is_none(), "large aggregates stripped");
        assert!(ctx.get("rvol").is_some());
    }
}
