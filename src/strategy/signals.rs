use chrono::{DateTime, Utc};

use super::filters::{exit_scam_filter, maturity_filter, time_filter};
use crate::config::AutoBotConfig;
use crate::error::TradingError;
use crate::indicators::{closed_candles, compute_indicators};
use crate::models::{Candle, Side, Signal, SignalRecord, Timeframe, Trend};

/// Everything the classifier needs to know about one symbol
#[derive(Debug, Clone)]
pub struct MarketContext<'a> {
    pub symbol: &'a str,
    pub candles: &'a [Candle],
    pub now: DateTime<Utc>,
    /// Side of the bot's open position, if any
    pub position: Option<Side>,
    /// Whether the maturity store has this symbol marked
    pub marked_mature: bool,
}

/// Validate that candles are uniformly spaced in time
///
/// # Returns
/// * `Ok(())` if consecutive candles are exactly one timeframe apart
/// * `Err` if candles are out of order or there are gaps in the data
pub fn validate_candle_uniformity(candles: &[Candle], timeframe: Timeframe) -> anyhow::Result<()> {
    if candles.len() < 2 {
        return Ok(());
    }

    let expected_secs = timeframe.duration().num_seconds();

    for window in candles.windows(2) {
        let time_diff = (window[1].open_time - window[0].open_time).num_seconds();

        if time_diff <= 0 {
            anyhow::bail!("Candles are not sorted by open time");
        }

        if time_diff != expected_secs {
            anyhow::bail!(
                "Data gap detected: {}s between candles (expected {}s). Gap from {} to {}",
                time_diff,
                expected_secs,
                window[0].open_time.format("%Y-%m-%d %H:%M"),
                window[1].open_time.format("%Y-%m-%d %H:%M")
            );
        }
    }

    Ok(())
}

/// Turn RSI, trend and the entry filters into one signal for a symbol
///
/// With an open position only exit rules apply (EXIT_* or HOLD). Without one,
/// an oversold/overbought RSI that respects the trend becomes an ENTER_*
/// candidate, which every filter must then allow. Insufficient data or a
/// blocked candidate yields NONE.
pub fn generate_signal(ctx: &MarketContext<'_>, config: &AutoBotConfig) -> SignalRecord {
    let last_price = ctx.candles.last().map(|c| c.close);
    let closed = closed_candles(ctx.candles, config.timeframe, ctx.now);

    if let Err(e) = validate_candle_uniformity(closed, config.timeframe) {
        tracing::warn!("{} - skipping due to data quality issue: {}", ctx.symbol, e);
        let mut record = SignalRecord::insufficient(
            ctx.symbol,
            config.timeframe,
            closed.len(),
            last_price,
            ctx.now,
        );
        record.blocked_by = Some(e.to_string());
        return record;
    }

    let snapshot = match compute_indicators(
        ctx.symbol,
        ctx.candles,
        config.timeframe,
        ctx.now,
        config.rsi_period,
        &config.trend,
    ) {
        Ok(snapshot) => snapshot,
        Err(TradingError::InsufficientData { have, need, .. }) => {
            tracing::debug!("{}: collecting data ({}/{} closed candles)", ctx.symbol, have, need);
            return SignalRecord::insufficient(
                ctx.symbol,
                config.timeframe,
                closed.len(),
                last_price,
                ctx.now,
            );
        }
        Err(e) => {
            tracing::warn!("{}: indicator failure: {}", ctx.symbol, e);
            return SignalRecord::insufficient(
                ctx.symbol,
                config.timeframe,
                closed.len(),
                last_price,
                ctx.now,
            );
        }
    };

    let rsi = snapshot.rsi;
    let mut record = SignalRecord {
        symbol: ctx.symbol.to_string(),
        timeframe: config.timeframe,
        rsi: Some(rsi),
        trend: snapshot.trend,
        signal: Signal::NoSignal,
        computed_at: ctx.now,
        last_price,
        closed_candles: snapshot.closed_count,
        blocked_by: None,
        maturity_info: Some(maturity_filter(
            snapshot.closed_count,
            config.min_candles_for_maturity,
            ctx.marked_mature,
        )),
        time_filter_info: None,
        exit_scam_info: None,
    };

    // Exit rules for an open position
    if let Some(side) = ctx.position {
        record.signal = match side {
            Side::Long if rsi >= config.rsi_exit_long => Signal::ExitLong,
            Side::Short if rsi <= config.rsi_exit_short => Signal::ExitShort,
            _ => Signal::Hold,
        };
        return record;
    }

    // Base entry rule
    let candidate = if rsi <= config.rsi_oversold {
        if config.avoid_down_trend && snapshot.trend == Trend::Down {
            record.blocked_by = Some(format!("RSI {:.1} oversold but trend is DOWN", rsi));
            None
        } else {
            Some(Side::Long)
        }
    } else if rsi >= config.rsi_overbought {
        if config.avoid_up_trend && snapshot.trend == Trend::Up {
            record.blocked_by = Some(format!("RSI {:.1} overbought but trend is UP", rsi));
            None
        } else {
            Some(Side::Short)
        }
    } else {
        None
    };

    let Some(side) = candidate else {
        return record;
    };

    record.time_filter_info = Some(time_filter(&snapshot.rsi_series, side, config));
    record.exit_scam_info = Some(exit_scam_filter(closed, config));

    // AND-gate, first blocking reason wins
    let blocking = [
        record.maturity_info.as_ref(),
        record.time_filter_info.as_ref(),
        record.exit_scam_info.as_ref(),
    ]
    .into_iter()
    .flatten()
    .find(|outcome| !outcome.allowed)
    .map(|outcome| outcome.reason.clone());

    match blocking {
        Some(reason) => {
            tracing::debug!("{}: {:?} entry blocked: {}", ctx.symbol, side, reason);
            record.blocked_by = Some(reason);
        }
        None => {
            record.signal = match side {
                Side::Long => Signal::EnterLong,
                Side::Short => Signal::EnterShort,
            };
            tracing::info!(
                "{}: {:?} (RSI={:.1}, trend={:?})",
                ctx.symbol,
                record.signal,
                rsi,
                snapshot.trend
            );
        }
    }

    record
}
