//! Market event model.
//!
//! An `EventRecord` captures something that HAPPENED at a specific instant,
//! as opposed to a screener condition that is continuously true. The tag set
//! is closed: new tags append, existing tags are never repurposed. Several
//! 1-minute indicator tags are deprecated and survive only so that stored
//! events keep deserializing; no detector emits them.

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::models::ticker::TickerState;

/// Closed set of market event tags.
///
/// Short codes in `short_code()` are the alert-registry identifiers used by
/// downstream consumers (Trade Ideas style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Price
    NewHigh,
    NewLow,
    CrossedAboveOpen,
    CrossedBelowOpen,
    CrossedAbovePrevClose,
    CrossedBelowPrevClose,

    // VWAP
    VwapCrossUp,
    VwapCrossDown,

    // Volume
    RvolSpike,
    VolumeSurge,
    VolumeSpike1Min,
    UnusualPrints,
    BlockTrade,

    // Momentum
    RunningUp,
    RunningDown,
    PercentUp5,
    PercentDown5,
    PercentUp10,
    PercentDown10,

    // Pullbacks
    Pullback75FromHigh,
    Pullback25FromHigh,
    Pullback75FromLow,
    Pullback25FromLow,
    Pullback75FromHighClose,
    Pullback25FromHighClose,
    Pullback75FromLowClose,
    Pullback25FromLowClose,
    Pullback75FromHighOpen,
    Pullback25FromHighOpen,
    Pullback75FromLowOpen,
    Pullback25FromLowOpen,

    // Gaps
    GapUpReversal,
    GapDownReversal,

    // Halts
    Halt,
    Resume,

    // DEPRECATED 1-minute price-vs-MA crosses. Stored events still carry
    // these tags; they are never emitted.
    CrossedAboveEma20,
    CrossedBelowEma20,
    CrossedAboveEma50,
    CrossedBelowEma50,
    CrossedAboveSma8,
    CrossedBelowSma8,
    CrossedAboveSma20,
    CrossedBelowSma20,
    CrossedAboveSma50,
    CrossedBelowSma50,

    // DEPRECATED 1-minute MA-to-MA / MACD / stochastic (replaced by 5-minute).
    Sma8CrossAbove20,
    Sma8CrossBelow20,
    MacdCrossBullish,
    MacdCrossBearish,
    MacdZeroCrossUp,
    MacdZeroCrossDown,
    StochCrossBullish,
    StochCrossBearish,
    StochOversold,
    StochOverbought,

    // Daily SMA crosses
    CrossedAboveSma20Daily,
    CrossedBelowSma20Daily,
    CrossedAboveSma50Daily,
    CrossedBelowSma50Daily,

    // 5-minute indicator crosses
    Sma8AboveSma205m,
    Sma8BelowSma205m,
    MacdAboveSignal5m,
    MacdBelowSignal5m,
    MacdAboveZero5m,
    MacdBelowZero5m,
    StochCrossBullish5m,
    StochCrossBearish5m,
    StochOversold5m,
    StochOverbought5m,

    // Opening range / consolidation breakouts
    OrbBreakoutUp,
    OrbBreakoutDown,
    ConsolidationBreakoutUp,
    ConsolidationBreakoutDown,

    // Bollinger bands
    BbUpperBreakout,
    BbLowerBreakdown,

    // Daily support / resistance
    CrossedDailyHighResistance,
    CrossedDailyLowSupport,

    // Gap variants
    FalseGapUpRetracement,
    FalseGapDownRetracement,

    // Momentum variants (time-window based)
    RunningUpSustained,
    RunningDownSustained,
    RunningUpConfirmed,
    RunningDownConfirmed,

    // Daily SMA(200)
    CrossedAboveSma200,
    CrossedBelowSma200,

    // Pre/post-market extremes
    PreMarketHigh,
    PreMarketLow,
    PostMarketHigh,
    PostMarketLow,

    // Confirmed crosses
    CrossedAboveOpenConfirmed,
    CrossedBelowOpenConfirmed,
    CrossedAboveCloseConfirmed,
    CrossedBelowCloseConfirmed,

    // VWAP divergence (tag reserved; no live detector yet)
    VwapDivergenceUp,
    VwapDivergenceDown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewHigh => "new_high",
            EventType::NewLow => "new_low",
            EventType::CrossedAboveOpen => "crossed_above_open",
            EventType::CrossedBelowOpen => "crossed_below_open",
            EventType::CrossedAbovePrevClose => "crossed_above_prev_close",
            EventType::CrossedBelowPrevClose => "crossed_below_prev_close",
            EventType::VwapCrossUp => "vwap_cross_up",
            EventType::VwapCrossDown => "vwap_cross_down",
            EventType::RvolSpike => "rvol_spike",
            EventType::VolumeSurge => "volume_surge",
            EventType::VolumeSpike1Min => "volume_spike_1min",
            EventType::UnusualPrints => "unusual_prints",
            EventType::BlockTrade => "block_trade",
            EventType::RunningUp => "running_up",
            EventType::RunningDown => "running_down",
            EventType::PercentUp5 => "percent_up_5",
            EventType::PercentDown5 => "percent_down_5",
            EventType::PercentUp10 => "percent_up_10",
            EventType::PercentDown10 => "percent_down_10",
            EventType::Pullback75FromHigh => "pullback_75_from_high",
            EventType::Pullback25FromHigh => "pullback_25_from_high",
            EventType::Pullback75FromLow => "pullback_75_from_low",
            EventType::Pullback25FromLow => "pullback_25_from_low",
            EventType::Pullback75FromHighClose => "pullback_75_from_high_close",
            EventType::Pullback25FromHighClose => "pullback_25_from_high_close",
            EventType::Pullback75FromLowClose => "pullback_75_from_low_close",
            EventType::Pullback25FromLowClose => "pullback_25_from_low_close",
            EventType::Pullback75FromHighOpen => "pullback_75_from_high_open",
            EventType::Pullback25FromHighOpen => "pullback_25_from_high_open",
            EventType::Pullback75FromLowOpen => "pullback_75_from_low_open",
            EventType::Pullback25FromLowOpen => "pullback_25_from_low_open",
            EventType::GapUpReversal => "gap_up_reversal",
            EventType::GapDownReversal => "gap_down_reversal",
            EventType::Halt => "halt",
            EventType::Resume => "resume",
            EventType::CrossedAboveEma20 => "crossed_above_ema20",
            EventType::CrossedBelowEma20 => "crossed_below_ema20",
            EventType::CrossedAboveEma50 => "crossed_above_ema50",
            EventType::CrossedBelowEma50 => "crossed_below_ema50",
            EventType::CrossedAboveSma8 => "crossed_above_sma8",
            EventType::CrossedBelowSma8 => "crossed_below_sma8",
            EventType::CrossedAboveSma20 => "crossed_above_sma20",
            EventType::CrossedBelowSma20 => "crossed_below_sma20",
            EventType::CrossedAboveSma50 => "crossed_above_sma50",
            EventType::CrossedBelowSma50 => "crossed_below_sma50",
            EventType::Sma8CrossAbove20 => "sma_8_cross_above_20",
            EventType::Sma8CrossBelow20 => "sma_8_cross_below_20",
            EventType::MacdCrossBullish => "macd_cross_bullish",
            EventType::MacdCrossBearish => "macd_cross_bearish",
            EventType::MacdZeroCrossUp => "macd_zero_cross_up",
            EventType::MacdZeroCrossDown => "macd_zero_cross_down",
            EventType::StochCrossBullish => "stoch_cross_bullish",
            EventType::StochCrossBearish => "stoch_cross_bearish",
            EventType::StochOversold => "stoch_oversold",
            EventType::StochOverbought => "stoch_overbought",
            EventType::CrossedAboveSma20Daily => "crossed_above_sma20_daily",
            EventType::CrossedBelowSma20Daily => "crossed_below_sma20_daily",
            EventType::CrossedAboveSma50Daily => "crossed_above_sma50_daily",
            EventType::CrossedBelowSma50Daily => "crossed_below_sma50_daily",
            EventType::Sma8AboveSma205m => "sma8_above_sma20_5min",
            EventType::Sma8BelowSma205m => "sma8_below_sma20_5min",
            EventType::MacdAboveSignal5m => "macd_above_signal_5min",
            EventType::MacdBelowSignal5m => "macd_below_signal_5min",
            EventType::MacdAboveZero5m => "macd_above_zero_5min",
            EventType::MacdBelowZero5m => "macd_below_zero_5min",
            EventType::StochCrossBullish5m => "stoch_cross_bullish_5min",
            EventType::StochCrossBearish5m => "stoch_cross_bearish_5min",
            EventType::StochOversold5m => "stoch_oversold_5min",
            EventType::StochOverbought5m => "stoch_overbought_5min",
            EventType::OrbBreakoutUp => "orb_breakout_up",
            EventType::OrbBreakoutDown => "orb_breakout_down",
            EventType::ConsolidationBreakoutUp => "consolidation_breakout_up",
            EventType::ConsolidationBreakoutDown => "consolidation_breakout_down",
            EventType::BbUpperBreakout => "bb_upper_breakout",
            EventType::BbLowerBreakdown => "bb_lower_breakdown",
            EventType::CrossedDailyHighResistance => "crossed_daily_high_resistance",
            EventType::CrossedDailyLowSupport => "crossed_daily_low_support",
            EventType::FalseGapUpRetracement => "false_gap_up_retracement",
            EventType::FalseGapDownRetracement => "false_gap_down_retracement",
            EventType::RunningUpSustained => "running_up_sustained",
            EventType::RunningDownSustained => "running_down_sustained",
            EventType::RunningUpConfirmed => "running_up_confirmed",
            EventType::RunningDownConfirmed => "running_down_confirmed",
            EventType::CrossedAboveSma200 => "crossed_above_sma200",
            EventType::CrossedBelowSma200 => "crossed_below_sma200",
            EventType::PreMarketHigh => "pre_market_high",
            EventType::PreMarketLow => "pre_market_low",
            EventType::PostMarketHigh => "post_market_high",
            EventType::PostMarketLow => "post_market_low",
            EventType::CrossedAboveOpenConfirmed => "crossed_above_open_confirmed",
            EventType::CrossedBelowOpenConfirmed => "crossed_below_open_confirmed",
            EventType::CrossedAboveCloseConfirmed => "crossed_above_close_confirmed",
            EventType::CrossedBelowCloseConfirmed => "crossed_below_close_confirmed",
            EventType::VwapDivergenceUp => "vwap_divergence_up",
            EventType::VwapDivergenceDown => "vwap_divergence_down",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        let ty = match s {
            "new_high" => EventType::NewHigh,
            "new_low" => EventType::NewLow,
            "crossed_above_open" => EventType::CrossedAboveOpen,
            "crossed_below_open" => EventType::CrossedBelowOpen,
            "crossed_above_prev_close" => EventType::CrossedAbovePrevClose,
            "crossed_below_prev_close" => EventType::CrossedBelowPrevClose,
            "vwap_cross_up" => EventType::VwapCrossUp,
            "vwap_cross_down" => EventType::VwapCrossDown,
            "rvol_spike" => EventType::RvolSpike,
            "volume_surge" => EventType::VolumeSurge,
            "volume_spike_1min" => EventType::VolumeSpike1Min,
            "unusual_prints" => EventType::UnusualPrints,
            "block_trade" => EventType::BlockTrade,
            "running_up" => EventType::RunningUp,
            "running_down" => EventType::RunningDown,
            "percent_up_5" => EventType::PercentUp5,
            "percent_down_5" => EventType::PercentDown5,
            "percent_up_10" => EventType::PercentUp10,
            "percent_down_10" => EventType::PercentDown10,
            "pullback_75_from_high" => EventType::Pullback75FromHigh,
            "pullback_25_from_high" => EventType::Pullback25FromHigh,
            "pullback_75_from_low" => EventType::Pullback75FromLow,
            "pullback_25_from_low" => EventType::Pullback25FromLow,
            "pullback_75_from_high_close" => EventType::Pullback75FromHighClose,
            "pullback_25_from_high_close" => EventType::Pullback25FromHighClose,
            "pullback_75_from_low_close" => EventType::Pullback75FromLowClose,
            "pullback_25_from_low_close" => EventType::Pullback25FromLowClose,
            "pullback_75_from_high_open" => EventType::Pullback75FromHighOpen,
            "pullback_25_from_high_open" => EventType::Pullback25FromHighOpen,
            "pullback_75_from_low_open" => EventType::Pullback75FromLowOpen,
            "pullback_25_from_low_open" => EventType::Pullback25FromLowOpen,
            "gap_up_reversal" => EventType::GapUpReversal,
            "gap_down_reversal" => EventType::GapDownReversal,
            "halt" => EventType::Halt,
            "resume" => EventType::Resume,
            "crossed_above_ema20" => EventType::CrossedAboveEma20,
            "crossed_below_ema20" => EventType::CrossedBelowEma20,
            "crossed_above_ema50" => EventType::CrossedAboveEma50,
            "crossed_below_ema50" => EventType::CrossedBelowEma50,
            "crossed_above_sma8" => EventType::CrossedAboveSma8,
            "crossed_below_sma8" => EventType::CrossedBelowSma8,
            "crossed_above_sma20" => EventType::CrossedAboveSma20,
            "crossed_below_sma20" => EventType::CrossedBelowSma20,
            "crossed_above_sma50" => EventType::CrossedAboveSma50,
            "crossed_below_sma50" => EventType::CrossedBelowSma50,
            "sma_8_cross_above_20" => EventType::Sma8CrossAbove20,
            "sma_8_cross_below_20" => EventType::Sma8CrossBelow20,
            "macd_cross_bullish" => EventType::MacdCrossBullish,
            "macd_cross_bearish" => EventType::MacdCrossBearish,
            "macd_zero_cross_up" => EventType::MacdZeroCrossUp,
            "macd_zero_cross_down" => EventType::MacdZeroCrossDown,
            "stoch_cross_bullish" => EventType::StochCrossBullish,
            "stoch_cross_bearish" => EventType::StochCrossBearish,
            "stoch_oversold" => EventType::StochOversold,
            "stoch_overbought" => EventType::StochOverbought,
            "crossed_above_sma20_daily" => EventType::CrossedAboveSma20Daily,
            "crossed_below_sma20_daily" => EventType::CrossedBelowSma20Daily,
            "crossed_above_sma50_daily" => EventType::CrossedAboveSma50Daily,
            "crossed_below_sma50_daily" => EventType::CrossedBelowSma50Daily,
            "sma8_above_sma20_5min" => EventType::Sma8AboveSma205m,
            "sma8_below_sma20_5min" => EventType::Sma8BelowSma205m,
            "macd_above_signal_5min" => EventType::MacdAboveSignal5m,
            "macd_below_signal_5min" => EventType::MacdBelowSignal5m,
            "macd_above_zero_5min" => EventType::MacdAboveZero5m,
            "macd_below_zero_5min" => EventType::MacdBelowZero5m,
            "stoch_cross_bullish_5min" => EventType::StochCrossBullish5m,
            "stoch_cross_bearish_5min" => EventType::StochCrossBearish5m,
            "stoch_oversold_5min" => EventType::StochOversold5m,
            "stoch_overbought_5min" => EventType::StochOverbought5m,
            "orb_breakout_up" => EventType::OrbBreakoutUp,
            "orb_breakout_down" => EventType::OrbBreakoutDown,
            "consolidation_breakout_up" => EventType::ConsolidationBreakoutUp,
            "consolidation_breakout_down" => EventType::ConsolidationBreakoutDown,
            "bb_upper_breakout" => EventType::BbUpperBreakout,
            "bb_lower_breakdown" => EventType::BbLowerBreakdown,
            "crossed_daily_high_resistance" => EventType::CrossedDailyHighResistance,
            "crossed_daily_low_support" => EventType::CrossedDailyLowSupport,
            "false_gap_up_retracement" => EventType::FalseGapUpRetracement,
            "false_gap_down_retracement" => EventType::FalseGapDownRetracement,
            "running_up_sustained" => EventType::RunningUpSustained,
            "running_down_sustained" => EventType::RunningDownSustained,
            "running_up_confirmed" => EventType::RunningUpConfirmed,
            "running_down_confirmed" => EventType::RunningDownConfirmed,
            "crossed_above_sma200" => EventType::CrossedAboveSma200,
            "crossed_below_sma200" => EventType::CrossedBelowSma200,
            "pre_market_high" => EventType::PreMarketHigh,
            "pre_market_low" => EventType::PreMarketLow,
            "post_market_high" => EventType::PostMarketHigh,
            "post_market_low" => EventType::PostMarketLow,
            "crossed_above_open_confirmed" => EventType::CrossedAboveOpenConfirmed,
            "crossed_below_open_confirmed" => EventType::CrossedBelowOpenConfirmed,
            "crossed_above_close_confirmed" => EventType::CrossedAboveCloseConfirmed,
            "crossed_below_close_confirmed" => EventType::CrossedBelowCloseConfirmed,
            "vwap_divergence_up" => EventType::VwapDivergenceUp,
            "vwap_divergence_down" => EventType::VwapDivergenceDown,
            _ => return None,
        };
        Some(ty)
    }

    /// Alert-registry short code, where one exists.
    pub fn short_code(&self) -> Option<&'static str> {
        let code = match self {
            EventType::NewHigh => "NHP",
            EventType::NewLow => "NLP",
            EventType::CrossedAboveOpen => "CAO",
            EventType::CrossedBelowOpen => "CBO",
            EventType::CrossedAbovePrevClose => "CAC",
            EventType::CrossedBelowPrevClose => "CBC",
            EventType::VwapCrossUp => "CAVC",
            EventType::VwapCrossDown => "CBVC",
            EventType::RvolSpike => "HRV",
            EventType::VolumeSurge => "SV",
            EventType::VolumeSpike1Min => "VS1",
            EventType::UnusualPrints => "UNOP",
            EventType::BlockTrade => "BP",
            EventType::RunningUp => "RUN",
            EventType::RunningDown => "RDN",
            EventType::PercentUp5 => "PUD",
            EventType::PercentDown5 => "PDD",
            EventType::PercentUp10 => "PU10",
            EventType::PercentDown10 => "PD10",
            EventType::Pullback75FromHigh => "PFH75",
            EventType::Pullback25FromHigh => "PFH25",
            EventType::Pullback75FromLow => "PFL75",
            EventType::Pullback25FromLow => "PFL25",
            EventType::Pullback75FromHighClose => "PFH75C",
            EventType::Pullback25FromHighClose => "PFH25C",
            EventType::Pullback75FromLowClose => "PFL75C",
            EventType::Pullback25FromLowClose => "PFL25C",
            EventType::Pullback75FromHighOpen => "PFH75O",
            EventType::Pullback25FromHighOpen => "PFH25O",
            EventType::Pullback75FromLowOpen => "PFL75O",
            EventType::Pullback25FromLowOpen => "PFL25O",
            EventType::GapUpReversal => "GUR",
            EventType::GapDownReversal => "GDR",
            EventType::Halt => "HALT",
            EventType::Resume => "RESUME",
            EventType::CrossedAboveSma20Daily => "CA20",
            EventType::CrossedBelowSma20Daily => "CB20",
            EventType::CrossedAboveSma50Daily => "CA50",
            EventType::CrossedBelowSma50Daily => "CB50",
            EventType::Sma8AboveSma205m => "ECAY5",
            EventType::Sma8BelowSma205m => "ECBY5",
            EventType::MacdAboveSignal5m => "MDAS5",
            EventType::MacdBelowSignal5m => "MDBS5",
            EventType::MacdAboveZero5m => "MDAZ5",
            EventType::MacdBelowZero5m => "MDBZ5",
            EventType::StochOversold5m => "SC20_5",
            EventType::StochOverbought5m => "SC80_5",
            EventType::OrbBreakoutUp => "ORBU",
            EventType::OrbBreakoutDown => "ORBD",
            EventType::ConsolidationBreakoutUp => "CBU",
            EventType::ConsolidationBreakoutDown => "CBD",
            EventType::BbUpperBreakout => "BBU",
            EventType::BbLowerBreakdown => "BBD",
            EventType::CrossedDailyHighResistance => "CDHR",
            EventType::CrossedDailyLowSupport => "CDLS",
            EventType::FalseGapUpRetracement => "FGUR",
            EventType::FalseGapDownRetracement => "FGDR",
            EventType::RunningUpSustained => "RU",
            EventType::RunningDownSustained => "RD",
            EventType::RunningUpConfirmed => "RUC",
            EventType::RunningDownConfirmed => "RDC",
            EventType::CrossedAboveSma200 => "CA200",
            EventType::CrossedBelowSma200 => "CB200",
            EventType::PreMarketHigh => "HPRE",
            EventType::PreMarketLow => "LPRE",
            EventType::PostMarketHigh => "HPOST",
            EventType::PostMarketLow => "LPOST",
            EventType::CrossedAboveOpenConfirmed => "CAOC",
            EventType::CrossedBelowOpenConfirmed => "CBOC",
            EventType::CrossedAboveCloseConfirmed => "CACC",
            EventType::CrossedBelowCloseConfirmed => "CBCC",
            EventType::VwapDivergenceUp => "VDU",
            EventType::VwapDivergenceDown => "VDD",
            _ => return None,
        };
        Some(code)
    }

    /// Tags kept only for backward compatibility with stored events.
    pub fn is_deprecated(&self) -> bool {
        matches!(
            self,
            EventType::CrossedAboveEma20
                | EventType::CrossedBelowEma20
                | EventType::CrossedAboveEma50
                | EventType::CrossedBelowEma50
                | EventType::CrossedAboveSma8
                | EventType::CrossedBelowSma8
                | EventType::CrossedAboveSma20
                | EventType::CrossedBelowSma20
                | EventType::CrossedAboveSma50
                | EventType::CrossedBelowSma50
                | EventType::Sma8CrossAbove20
                | EventType::Sma8CrossBelow20
                | EventType::MacdCrossBullish
                | EventType::MacdCrossBearish
                | EventType::MacdZeroCrossUp
                | EventType::MacdZeroCrossDown
                | EventType::StochCrossBullish
                | EventType::StochCrossBearish
                | EventType::StochOversold
                | EventType::StochOverbought
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventType::parse(&s).ok_or_else(|| D::Error::custom(format!("unknown event type '{s}'")))
    }
}

/// A discrete market event plus the context captured at fire time.
///
/// Created by a detector with the event-specific values filled in; the engine
/// completes the context fields inside the per-symbol serialized region so
/// the snapshot matches the state that produced the fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub event_type: EventType,
    pub rule_id: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,

    // Event-specific values
    pub prev_value: Option<f64>,
    pub new_value: Option<f64>,
    pub delta: Option<f64>,
    pub delta_percent: Option<f64>,

    // Context at event time
    pub change_percent: Option<f64>,
    pub rvol: Option<f64>,
    pub volume: Option<i64>,
    pub market_cap: Option<f64>,
    pub gap_percent: Option<f64>,
    pub change_from_open: Option<f64>,
    pub open_price: Option<f64>,
    pub prev_close: Option<f64>,
    pub vwap: Option<f64>,
    pub atr_percent: Option<f64>,
    pub intraday_high: Option<f64>,
    pub intraday_low: Option<f64>,

    // Time-window changes
    pub chg_1min: Option<f64>,
    pub chg_5min: Option<f64>,
    pub chg_10min: Option<f64>,
    pub chg_15min: Option<f64>,
    pub chg_30min: Option<f64>,
    pub vol_1min: Option<i64>,
    pub vol_5min: Option<i64>,

    // Technical indicators
    pub float_shares: Option<f64>,
    pub rsi: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,

    // Fundamentals
    pub security_type: Option<String>,
    pub sector: Option<String>,

    pub details: Option<Map<String, Value>>,
}

impl EventRecord {
    pub fn new(
        event_type: EventType,
        rule_id: impl Into<String>,
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        price: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            rule_id: rule_id.into(),
            symbol: symbol.into(),
            timestamp,
            price,
            prev_value: None,
            new_value: None,
            delta: None,
            delta_percent: None,
            change_percent: None,
            rvol: None,
            volume: None,
            market_cap: None,
            gap_percent: None,
            change_from_open: None,
            open_price: None,
            prev_close: None,
            vwap: None,
            atr_percent: None,
            intraday_high: None,
            intraday_low: None,
            chg_1min: None,
            chg_5min: None,
            chg_10min: None,
            chg_15min: None,
            chg_30min: None,
            vol_1min: None,
            vol_5min: None,
            float_shares: None,
            rsi: None,
            ema_20: None,
            ema_50: None,
            security_type: None,
            sector: None,
            details: None,
        }
    }

    /// Set `prev_value`/`new_value` and derive `delta`/`delta_percent`.
    pub fn with_values(mut self, prev_value: f64, new_value: f64) -> Self {
        self.prev_value = Some(prev_value);
        self.new_value = Some(new_value);
        self.delta = Some(new_value - prev_value);
        if prev_value.abs() > f64::EPSILON {
            self.delta_percent = Some((new_value - prev_value) / prev_value.abs() * 100.0);
        }
        self
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    /// Fill the ~40 scalar context fields from the state that fired.
    pub fn capture_context(&mut self, state: &TickerState) {
        self.change_percent = state.change_percent;
        self.rvol = state.rvol;
        self.volume = Some(state.volume);
        self.market_cap = state.market_cap;
        self.gap_percent = state.gap_percent;
        self.change_from_open = state.change_from_open;
        self.open_price = state.open;
        self.prev_close = state.prev_close;
        self.vwap = state.vwap;
        self.atr_percent = state.atr_percent;
        self.intraday_high = state.intraday_high;
        self.intraday_low = state.intraday_low;
        self.chg_1min = state.chg_1min;
        self.chg_5min = state.chg_5min;
        self.chg_10min = state.chg_10min;
        self.chg_15min = state.chg_15min;
        self.chg_30min = state.chg_30min;
        self.vol_1min = state.vol_1min;
        self.vol_5min = state.vol_5min;
        self.float_shares = state.float_shares;
        self.rsi = state.rsi;
        self.ema_20 = state.ema_20;
        self.ema_50 = state.ema_50;
        self.security_type = state.security_type.clone();
        self.sector = state.sector.clone();
    }

    /// Serialize for the Redis event stream: nulls omitted, `details`
    /// JSON-stringified. Column order is stable; new fields append only.
    pub fn to_stream_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields: Vec<(&'static str, String)> = vec![
            ("id", self.id.clone()),
            ("event_type", self.event_type.as_str().to_string()),
            ("rule_id", self.rule_id.clone()),
            ("symbol", self.symbol.clone()),
            ("timestamp", self.timestamp.to_rfc3339()),
            ("price", self.price.to_string()),
        ];

        let floats: [(&'static str, Option<f64>); 24] = [
            ("prev_value", self.prev_value),
            ("new_value", self.new_value),
            ("delta", self.delta),
            ("delta_percent", self.delta_percent),
            ("change_percent", self.change_percent),
            ("rvol", self.rvol),
            ("market_cap", self.market_cap),
            ("gap_percent", self.gap_percent),
            ("change_from_open", self.change_from_open),
            ("open_price", self.open_price),
            ("prev_close", self.prev_close),
            ("vwap", self.vwap),
            ("atr_percent", self.atr_percent),
            ("intraday_high", self.intraday_high),
            ("intraday_low", self.intraday_low),
            ("chg_1min", self.chg_1min),
            ("chg_5min", self.chg_5min),
            ("chg_10min", self.chg_10min),
            ("chg_15min", self.chg_15min),
            ("chg_30min", self.chg_30min),
            ("float_shares", self.float_shares),
            ("rsi", self.rsi),
            ("ema_20", self.ema_20),
            ("ema_50", self.ema_50),
        ];
        for (key, val) in floats {
            if let Some(v) = val {
                fields.push((key, v.to_string()));
            }
        }

        let ints: [(&'static str, Option<i64>); 3] = [
            ("volume", self.volume),
            ("vol_1min", self.vol_1min),
            ("vol_5min", self.vol_5min),
        ];
        for (key, val) in ints {
            if let Some(v) = val {
                fields.push((key, v.to_string()));
            }
        }

        if let Some(st) = &self.security_type {
            fields.push(("security_type", st.clone()));
        }
        if let Some(sector) = &self.sector {
            fields.push(("sector", sector.clone()));
        }
        if let Some(details) = &self.details {
            fields.push((
                "details",
                serde_json::to_string(details).unwrap_or_else(|_| "{}".to_string()),
            ));
        }

        fields
    }

    /// Restore a record from stream fields. Tolerates deprecated tags and
    /// missing optionals; returns None when identity fields are absent.
    pub fn from_stream_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let f = |key: &str| -> Option<f64> { fields.get(key).and_then(|v| v.parse().ok()) };
        let i = |key: &str| -> Option<i64> { fields.get(key).and_then(|v| v.parse().ok()) };

        let event_type = EventType::parse(fields.get("event_type")?)?;
        let timestamp = DateTime::parse_from_rfc3339(fields.get("timestamp")?)
            .ok()?
            .with_timezone(&Utc);

        Some(Self {
            id: fields.get("id")?.clone(),
            event_type,
            rule_id: fields.get("rule_id")?.clone(),
            symbol: fields.get("symbol")?.clone(),
            timestamp,
            price: f("price")?,
            prev_value: f("prev_value"),
            new_value: f("new_value"),
            delta: f("delta"),
            delta_percent: f("delta_percent"),
            change_percent: f("change_percent"),
            rvol: f("rvol"),
            volume: i("volume"),
            market_cap: f("market_cap"),
            gap_percent: f("gap_percent"),
            change_from_open: f("change_from_open"),
            open_price: f("open_price"),
            prev_close: f("prev_close"),
            vwap: f("vwap"),
            atr_percent: f("atr_percent"),
            intraday_high: f("intraday_high"),
            intraday_low: f("intraday_low"),
            chg_1min: f("chg_1min"),
            chg_5min: f("chg_5min"),
            chg_10min: f("chg_10min"),
            chg_15min: f("chg_15min"),
            chg_30min: f("chg_30min"),
            vol_1min: i("vol_1min"),
            vol_5min: i("vol_5min"),
            float_shares: f("float_shares"),
            rsi: f("rsi"),
            ema_20: f("ema_20"),
            ema_50: f("ema_50"),
            security_type: fields.get("security_type").cloned(),
            sector: fields.get("sector").cloned(),
            details: fields
                .get("details")
                .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_type_round_trip() {
        let all = [
            EventType::NewHigh,
            EventType::VwapCrossUp,
            EventType::Sma8AboveSma205m,
            EventType::StochOverbought5m,
            EventType::Pullback25FromLowOpen,
            EventType::RunningUpConfirmed,
            EventType::CrossedBelowCloseConfirmed,
            EventType::Sma8CrossAbove20,
        ];
        for ty in all {
            assert_eq!(EventType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EventType::parse("not_a_tag"), None);
    }

    #[test]
    fn test_deprecated_tags_still_parse() {
        let ty = EventType::parse("macd_zero_cross_up").unwrap();
        assert!(ty.is_deprecated());
        assert!(ty.short_code().is_none());
    }

    #[test]
    fn test_short_codes() {
        assert_eq!(EventType::RvolSpike.short_code(), Some("HRV"));
        assert_eq!(EventType::OrbBreakoutUp.short_code(), Some("ORBU"));
        assert_eq!(EventType::StochCrossBullish5m.short_code(), None);
    }

    #[test]
    fn test_stream_round_trip_omits_nulls() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 15, 30, 0).unwrap();
        let mut event = EventRecord::new(EventType::NewHigh, "event:system:new_high", "TSLA", ts, 250.5)
            .with_values(250.0, 250.5)
            .with_detail("note", Value::String("session high".into()));
        event.rvol = Some(4.2);

        let fields = event.to_stream_fields();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
        assert!(keys.contains(&"rvol"));
        assert!(!keys.contains(&"vwap"), "null fields must be omitted");

        let map: HashMap<String, String> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = EventRecord::from_stream_fields(&map).unwrap();
        assert_eq!(restored.event_type, EventType::NewHigh);
        assert_eq!(restored.symbol, "TSLA");
        assert_eq!(restored.prev_value, Some(250.0));
        assert_eq!(restored.delta, Some(0.5));
        assert_eq!(restored.vwap, None);
        assert_eq!(
            restored.details.unwrap().get("note"),
            Some(&Value::String("session high".into()))
        );
    }

    #[test]
    fn test_with_values_derives_delta() {
        let ts = Utc::now();
        let event =
            EventRecord::new(EventType::NewHigh, "r", "A", ts, 250.5).with_values(250.0, 250.5);
        assert!((event.delta.unwrap() - 0.5).abs() < 1e-9);
        assert!((event.delta_percent.unwrap() - 0.2).abs() < 1e-9);
    }
}
