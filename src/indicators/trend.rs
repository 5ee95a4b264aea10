use serde::{Deserialize, Serialize};

use super::moving_average::{calculate_ema, calculate_ema_series};
use crate::models::Trend;

/// Parameters for the EMA trend check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrendConfig {
    pub ema_short: usize,
    pub ema_long: usize,
    /// Minimum EMA separation, in percent of the long EMA
    pub threshold_percent: f64,
    /// How many candles back the short EMA slope is measured
    pub slope_candles: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            ema_short: 50,
            ema_long: 200,
            threshold_percent: 0.5,
            slope_candles: 5,
        }
    }
}

/// Classify trend from closed-candle closes
///
/// Short EMA above the long EMA by more than the threshold with a rising short
/// EMA is UP, the mirror image is DOWN, anything else is FLAT. Without enough
/// history for the long EMA, price vs short EMA is used instead.
pub fn determine_trend(closes: &[f64], config: &TrendConfig) -> Trend {
    let threshold = config.threshold_percent / 100.0;

    if closes.len() >= config.ema_long {
        let short_series = calculate_ema_series(closes, config.ema_short);
        let long = match calculate_ema(closes, config.ema_long) {
            Some(v) if v > 0.0 => v,
            _ => return Trend::Flat,
        };
        let short = match short_series.last() {
            Some(v) => *v,
            None => return Trend::Flat,
        };

        let slope = short_slope(&short_series, config.slope_candles);
        let separation = (short - long) / long;

        if separation > threshold && slope > 0.0 {
            return Trend::Up;
        }
        if separation < -threshold && slope < 0.0 {
            return Trend::Down;
        }
        return Trend::Flat;
    }

    // Not enough history for the long EMA
    let (Some(short), Some(price)) = (calculate_ema(closes, config.ema_short), closes.last())
    else {
        return Trend::Flat;
    };
    if short <= 0.0 {
        return Trend::Flat;
    }

    let distance = (price - short) / short;
    if distance > threshold {
        Trend::Up
    } else if distance < -threshold {
        Trend::Down
    } else {
        Trend::Flat
    }
}

fn short_slope(series: &[f64], lookback: usize) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let back = lookback.max(1).min(series.len() - 1);
    series[series.len() - 1] - series[series.len() - 1 - back]
}
