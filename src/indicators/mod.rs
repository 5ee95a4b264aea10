// Technical indicators module
// Implements RSI, EMA and EMA trend over closed candles only

pub mod moving_average;
pub mod rsi;
pub mod trend;

use chrono::{DateTime, Utc};

use crate::error::TradingError;
use crate::models::{Candle, Timeframe, Trend};
use crate::Result;

pub use moving_average::{calculate_ema, calculate_ema_series};
pub use rsi::{calculate_rsi, calculate_rsi_series};
pub use trend::{determine_trend, TrendConfig};

/// Keep only the candles whose timeframe has fully elapsed at `now`
///
/// Candles are ordered oldest -> newest, so the forming candle (if any) is a
/// suffix; everything before the first unclosed candle is returned.
pub fn closed_candles(candles: &[Candle], timeframe: Timeframe, now: DateTime<Utc>) -> &[Candle] {
    let closed = candles
        .iter()
        .position(|c| !c.is_closed(timeframe, now))
        .unwrap_or(candles.len());
    &candles[..closed]
}

/// Indicator values for one symbol at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    /// RSI history, oldest first, ending with `rsi`
    pub rsi_series: Vec<f64>,
    pub trend: Trend,
    pub closed_count: usize,
}

/// Compute RSI and trend for a candle series
///
/// Fails closed with `InsufficientData` when fewer than `rsi_period + 1`
/// closed candles exist; callers must treat that as "no signal".
pub fn compute_indicators(
    symbol: &str,
    candles: &[Candle],
    timeframe: Timeframe,
    now: DateTime<Utc>,
    rsi_period: usize,
    trend_config: &TrendConfig,
) -> Result<IndicatorSnapshot> {
    let closed = closed_candles(candles, timeframe, now);
    let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();

    let rsi_series = calculate_rsi_series(&closes, rsi_period);
    let Some(&rsi) = rsi_series.last() else {
        return Err(TradingError::InsufficientData {
            symbol: symbol.to_string(),
            have: closes.len(),
            need: rsi_period + 1,
        });
    };

    let trend = determine_trend(&closes, trend_config);

    tracing::debug!(
        "{} indicators: RSI={:.1}, trend={:?}, closed candles={}",
        symbol,
        rsi,
        trend,
        closes.len()
    );

    Ok(IndicatorSnapshot {
        rsi,
        rsi_series,
        trend,
        closed_count: closes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candles_ending_at(end: DateTime<Utc>, closes: &[f64], timeframe: Timeframe) -> Vec<Candle> {
        let n = closes.len() as i32;
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: end - timeframe.duration() * (n - i as i32),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_closed_candles_drops_forming_candle() {
        let now = Utc::now();
        let mut candles = candles_ending_at(now, &[1.0, 2.0, 3.0], Timeframe::H1);
        candles.push(Candle {
            open_time: now - Duration::minutes(10),
            open: 3.0,
            high: 3.0,
            low: 3.0,
            close: 3.0,
            volume: 1.0,
        });

        assert_eq!(closed_candles(&candles, Timeframe::H1, now).len(), 3);
    }

    #[test]
    fn test_insufficient_data_fails_closed() {
        let now = Utc::now();
        let candles = candles_ending_at(now, &[100.0; 14], Timeframe::H1);

        let result = compute_indicators("BTCUSDT", &candles, Timeframe::H1, now, 14, &TrendConfig::default());
        match result {
            Err(TradingError::InsufficientData { have, need, .. }) => {
                assert_eq!(have, 14);
                assert_eq!(need, 15);
            }
            other => panic!("expected InsufficientData, got {:?}", other),
        }
    }

    #[test]
    fn test_unclosed_candle_does_not_change_rsi() {
        let now = Utc::now();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + ((i * 7) % 11) as f64).collect();
        let candles = candles_ending_at(now, &closes, Timeframe::M15);

        let before =
            compute_indicators("ETHUSDT", &candles, Timeframe::M15, now, 14, &TrendConfig::default())
                .unwrap();

        let mut with_forming = candles.clone();
        with_forming.push(Candle {
            open_time: now - Duration::minutes(3),
            open: 150.0,
            high: 500.0,
            low: 1.0,
            close: 1.0,
            volume: 99999.0,
        });

        let after = compute_indicators(
            "ETHUSDT",
            &with_forming,
            Timeframe::M15,
            now,
            14,
            &TrendConfig::default(),
        )
        .unwrap();

        assert_eq!(before.rsi, after.rsi);
        assert_eq!(before.trend, after.trend);
        assert_eq!(before.closed_count, after.closed_count);
    }
}
