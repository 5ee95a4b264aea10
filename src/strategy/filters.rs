//! Entry filters. Each one can only block an entry, never force one.

use crate::config::AutoBotConfig;
use crate::models::{Candle, FilterOutcome, Side};

/// Symbol must have enough closed history and be marked mature in the store
pub fn maturity_filter(closed_count: usize, min_candles: usize, marked_mature: bool) -> FilterOutcome {
    if closed_count < min_candles {
        return FilterOutcome::block(format!(
            "immature: {} closed candles, need {}",
            closed_count, min_candles
        ));
    }
    if !marked_mature {
        return FilterOutcome::block("immature: not marked mature in maturity store");
    }
    FilterOutcome::allow(format!("mature ({} candles)", closed_count))
}

/// Block entries right after an extreme RSI reading
///
/// Looks at the last `time_filter_candles` RSI values (current one included) for
/// a reading at or beyond the extreme level on the entry side. If one exists,
/// at least `time_filter_min_calm_candles` candles must have passed since it.
pub fn time_filter(rsi_series: &[f64], side: Side, config: &AutoBotConfig) -> FilterOutcome {
    if !config.time_filter_enabled {
        return FilterOutcome::allow("time filter disabled");
    }
    if rsi_series.is_empty() {
        return FilterOutcome::block("time filter: no RSI history");
    }

    let window = config.time_filter_candles.max(1).min(rsi_series.len());
    let recent = &rsi_series[rsi_series.len() - window..];

    let is_extreme = |rsi: f64| match side {
        Side::Long => rsi <= config.time_filter_extreme_low,
        Side::Short => rsi >= config.time_filter_extreme_high,
    };

    let Some(last_extreme) = recent.iter().rposition(|&rsi| is_extreme(rsi)) else {
        return FilterOutcome::allow(format!("no extreme RSI in last {} candles", window));
    };

    let candles_since = recent.len() - 1 - last_extreme;
    if candles_since < config.time_filter_min_calm_candles {
        FilterOutcome::block(format!(
            "extreme RSI {:.1} {} candles ago, need {} calm candles",
            recent[last_extreme], candles_since, config.time_filter_min_calm_candles
        ))
    } else {
        FilterOutcome::allow(format!(
            "last extreme RSI {:.1} was {} candles ago",
            recent[last_extreme], candles_since
        ))
    }
}

/// Block entries after a violent price move (possible pump/dump or rug)
pub fn exit_scam_filter(closed: &[Candle], config: &AutoBotConfig) -> FilterOutcome {
    if !config.exit_scam_enabled {
        return FilterOutcome::allow("exit scam filter disabled");
    }
    if closed.is_empty() {
        return FilterOutcome::block("exit scam filter: no candles");
    }

    let window = config.exit_scam_candles.min(closed.len());
    for candle in &closed[closed.len() - window..] {
        if candle.open <= 0.0 {
            continue;
        }
        let move_pct = ((candle.close - candle.open) / candle.open).abs() * 100.0;
        if move_pct > config.exit_scam_single_candle_percent {
            return FilterOutcome::block(format!(
                "single candle moved {:.1}% (limit {:.1}%)",
                move_pct, config.exit_scam_single_candle_percent
            ));
        }
    }

    let count = config.exit_scam_multi_candle_count.min(closed.len());
    let span = &closed[closed.len() - count..];
    if let (Some(first), Some(last)) = (span.first(), span.last()) {
        if first.open > 0.0 {
            let move_pct = ((last.close - first.open) / first.open).abs() * 100.0;
            if move_pct > config.exit_scam_multi_candle_percent {
                return FilterOutcome::block(format!(
                    "{} candles moved {:.1}% (limit {:.1}%)",
                    count, move_pct, config.exit_scam_multi_candle_percent
                ));
            }
        }
    }

    FilterOutcome::allow("no rapid price move")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candle(open: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now() - Duration::hours(1),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_maturity_requires_count_and_mark() {
        assert!(!maturity_filter(100, 400, true).allowed);
        assert!(!maturity_filter(500, 400, false).allowed);
        assert!(maturity_filter(400, 400, true).allowed);
    }

    #[test]
    fn test_time_filter_blocks_fresh_extreme() {
        let config = AutoBotConfig::default(); // window 8, low 20, calm 4
        let series = vec![40.0, 35.0, 30.0, 18.0, 22.0, 25.0, 27.0];

        let outcome = time_filter(&series, Side::Long, &config);
        assert!(!outcome.allowed);
        assert!(outcome.reason.contains("3 candles ago"));
    }

    #[test]
    fn test_time_filter_allows_after_calm_period() {
        let config = AutoBotConfig::default();
        let series = vec![18.0, 22.0, 25.0, 27.0, 28.0, 26.0];

        let outcome = time_filter(&series, Side::Long, &config);
        assert!(outcome.allowed, "{}", outcome.reason);
    }

    #[test]
    fn test_time_filter_current_extreme_blocks() {
        let config = AutoBotConfig::default();
        let series = vec![40.0, 35.0, 15.0];
        assert!(!time_filter(&series, Side::Long, &config).allowed);
        // Only low readings matter for shorts
        assert!(time_filter(&series, Side::Short, &config).allowed);
    }

    #[test]
    fn test_exit_scam_single_candle() {
        let config = AutoBotConfig::default();
        let mut candles = vec![candle(100.0, 101.0); 10];
        candles.push(candle(101.0, 80.0)); // -20.8%

        let outcome = exit_scam_filter(&candles, &config);
        assert!(!outcome.allowed);
        assert!(outcome.reason.contains("single candle"));
    }

    #[test]
    fn test_exit_scam_multi_candle() {
        let config = AutoBotConfig::default(); // 4 candles, 50%
        let candles = vec![
            candle(100.0, 100.0),
            candle(100.0, 114.0),
            candle(114.0, 128.0),
            candle(128.0, 142.0),
            candle(142.0, 156.0),
        ];

        let outcome = exit_scam_filter(&candles, &config);
        assert!(!outcome.allowed);
        assert!(outcome.reason.contains("4 candles"));
    }

    #[test]
    fn test_exit_scam_calm_market() {
        let config = AutoBotConfig::default();
        let candles = vec![candle(100.0, 102.0); 12];
        assert!(exit_scam_filter(&candles, &config).allowed);
    }
}
