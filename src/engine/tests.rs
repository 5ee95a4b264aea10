use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::broadcast;

use super::*;
use crate::bots::{Bot, BotSettings, BotStatus, ExitReason, TradeRecord};
use crate::config::{AutoBotConfig, EngineSettings, VolumeMode};
use crate::error::TradingError;
use crate::exchange::{ExchangeClient, PaperExchange};
use crate::models::{Candle, ExchangePosition, Side, Signal, Timeframe};
use crate::notify::{BroadcastNotifier, NotificationEvent};
use crate::persistence::{test_dir, FileMaturityStore, JsonFileStore, JsonlTradeHistory, TradeHistory};

struct Harness {
    core: Arc<TradingCore>,
    exchange: Arc<PaperExchange>,
    events: broadcast::Receiver<NotificationEvent>,
    dir: PathBuf,
}

impl Harness {
    fn drain(&mut self) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn cleanup(self) {
        let _ = tokio::fs::remove_dir_all(&self.dir).await;
    }
}

fn config() -> AutoBotConfig {
    AutoBotConfig {
        timeframe: Timeframe::H1,
        min_candles_for_maturity: 30,
        time_filter_enabled: false,
        avoid_down_trend: false,
        avoid_up_trend: false,
        default_volume_mode: VolumeMode::Usdt,
        default_volume_value: 10.0,
        ..Default::default()
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        lock_timeout_ms: 200,
        exchange_timeout_secs: 2,
        exchange_max_retries: 1,
        retry_backoff_ms: 1,
        pending_entry_grace_secs: 0,
        reconcile_alert_after: 2,
        ..Default::default()
    }
}

/// Steadily falling hourly candles; the last one is still forming
fn falling_candles(count: usize, start: f64) -> Vec<Candle> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let close = start - i as f64 * 0.5;
            Candle {
                open_time: now - Duration::minutes(30) - Duration::hours((count - 1 - i) as i64),
                open: close + 0.5,
                high: close + 0.6,
                low: close - 0.1,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

async fn harness_with(config: AutoBotConfig, settings: EngineSettings) -> Harness {
    let dir = test_dir();
    let history = Arc::new(JsonlTradeHistory::open(dir.join("trades.jsonl")).await.unwrap());
    harness_on(dir, config, settings, history).await
}

async fn harness_on(
    dir: PathBuf,
    config: AutoBotConfig,
    settings: EngineSettings,
    history: Arc<dyn TradeHistory>,
) -> Harness {
    let exchange = Arc::new(PaperExchange::new(1000.0, config.leverage));
    exchange.set_candles("BTCUSDT", falling_candles(61, 100.0));
    exchange.set_candles("ETHUSDT", falling_candles(61, 100.0));

    let notifier = BroadcastNotifier::new(256);
    let events = notifier.subscribe();
    let deps = CoreDeps {
        exchange: exchange.clone(),
        store: Arc::new(JsonFileStore::new(dir.join("state.json"))),
        maturity: Arc::new(FileMaturityStore::open(dir.join("mature.json")).await.unwrap()),
        history,
        notifier: Arc::new(notifier),
    };
    let core = TradingCore::start(
        deps,
        settings,
        config,
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
    )
    .await
    .unwrap();

    Harness {
        core,
        exchange,
        events,
        dir,
    }
}

async fn harness() -> Harness {
    harness_with(config(), settings()).await
}

/// Create a bot, compute its signal and tick it into a position
async fn open_long(h: &Harness, symbol: &str) {
    h.core.create_bot(symbol, None).await.unwrap();
    let record = h.core.refresh_symbol(symbol).await.unwrap();
    assert_eq!(record.signal, Signal::EnterLong);
    let outcome = h.core.tick_bot(symbol).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Entered { side: Side::Long, .. }));
}

#[tokio::test]
async fn test_entry_arms_stop_and_records_fill() {
    let mut h = harness().await;
    open_long(&h, "BTCUSDT").await;

    let bot = h.core.get_bot("BTCUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::InPositionLong);
    assert_eq!(bot.entry_price, Some(70.0));
    assert!(bot.stop_loss_order_id.is_some());

    let position = h.exchange.position("BTCUSDT").unwrap();
    let trigger = position.stop_loss.unwrap();
    assert!((trigger - 59.5).abs() < 1e-9);

    let kinds: Vec<_> = h.drain().iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&"position_opened"));
    assert!(kinds.contains(&"stop_loss_armed"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_concurrency_cap_blocks_second_entry() {
    let h = harness_with(
        AutoBotConfig {
            max_concurrent_bots: 1,
            ..config()
        },
        settings(),
    )
    .await;
    open_long(&h, "BTCUSDT").await;

    h.core.create_bot("ETHUSDT", None).await.unwrap();
    h.core.refresh_symbol("ETHUSDT").await.unwrap();
    let outcome = h.core.tick_bot("ETHUSDT").await.unwrap();
    assert!(matches!(outcome, TickOutcome::EntryBlocked(ref r) if r.contains("concurrency")));
    assert_eq!(h.core.get_bot("ETHUSDT").unwrap().status, BotStatus::Idle);
    assert!(h.exchange.position("ETHUSDT").is_none());
    h.cleanup().await;
}

#[tokio::test]
async fn test_risk_cap_blocks_entry() {
    // 1000 balance, 1% cap leaves 10 USDT; 25 USDT margin does not fit
    let h = harness_with(
        AutoBotConfig {
            risk_cap_percent: 1.0,
            default_volume_value: 25.0,
            ..config()
        },
        settings(),
    )
    .await;
    h.core.create_bot("BTCUSDT", None).await.unwrap();
    h.core.refresh_symbol("BTCUSDT").await.unwrap();

    let outcome = h.core.tick_bot("BTCUSDT").await.unwrap();
    assert!(matches!(outcome, TickOutcome::EntryBlocked(ref r) if r.contains("risk cap")));
    h.cleanup().await;
}

#[tokio::test]
async fn test_failed_entry_returns_to_idle() {
    let mut h = harness().await;
    h.core.create_bot("BTCUSDT", None).await.unwrap();
    h.core.refresh_symbol("BTCUSDT").await.unwrap();
    h.exchange.fail_orders(true);

    let outcome = h.core.tick_bot("BTCUSDT").await.unwrap();
    assert!(matches!(outcome, TickOutcome::EntryFailed(_)));
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::Idle);
    assert!(h.drain().iter().any(|e| e.kind() == "entry_failed"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_close_failure_alerts_after_max_attempts() {
    let mut h = harness_with(
        AutoBotConfig {
            max_close_attempts: 2,
            ..config()
        },
        settings(),
    )
    .await;
    open_long(&h, "BTCUSDT").await;

    h.exchange.fail_orders(true);
    h.exchange.set_price("BTCUSDT", 84.0 * 70.0 / 100.0);
    h.core.refresh_symbol("BTCUSDT").await.unwrap();
    h.drain();

    assert_eq!(h.core.tick_bot("BTCUSDT").await.unwrap(), TickOutcome::CloseFailed);
    assert!(!h.drain().iter().any(|e| e.kind() == "close_failed"));

    // Stays CLOSING and retries each tick
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::Closing);
    assert_eq!(h.core.tick_bot("BTCUSDT").await.unwrap(), TickOutcome::CloseFailed);
    assert!(h.drain().iter().any(|e| e.kind() == "close_failed"));

    h.exchange.fail_orders(false);
    assert_eq!(
        h.core.tick_bot("BTCUSDT").await.unwrap(),
        TickOutcome::Closed {
            reason: ExitReason::StopLoss
        }
    );
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::Idle);
    h.cleanup().await;
}

#[tokio::test]
async fn test_stop_bot_fails_when_close_fails() {
    let h = harness().await;
    open_long(&h, "BTCUSDT").await;
    h.exchange.fail_orders(true);

    let err = h.core.stop_bot("BTCUSDT").await.unwrap_err();
    assert_eq!(err.code(), "EXCHANGE_UNAVAILABLE");
    assert!(h.core.get_bot("BTCUSDT").is_some());

    h.exchange.fail_orders(false);
    let trade = h.core.stop_bot("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(trade.reason, ExitReason::Manual);
    assert!(h.core.get_bot("BTCUSDT").is_none());
    assert!(h.exchange.position("BTCUSDT").is_none());
    h.cleanup().await;
}

#[tokio::test]
async fn test_pending_entry_confirmed_by_reconcile() {
    let mut h = harness().await;
    h.exchange.hold_entries(true);
    h.core.create_bot("BTCUSDT", None).await.unwrap();
    h.core.refresh_symbol("BTCUSDT").await.unwrap();

    assert_eq!(h.core.tick_bot("BTCUSDT").await.unwrap(), TickOutcome::EntryPlaced);
    let bot = h.core.get_bot("BTCUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::PendingEntry);
    let order_id = bot.order_id.clone().unwrap();

    assert!(h.exchange.fill_order(&order_id));
    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.entries_confirmed, 1);

    let bot = h.core.get_bot("BTCUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::InPositionLong);
    assert_eq!(bot.order_id.as_deref(), Some(order_id.as_str()));
    assert!(h.drain().iter().any(|e| e.kind() == "stop_loss_armed"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_vanished_pending_entry_fails_after_grace() {
    let h = harness().await;
    h.exchange.hold_entries(true);
    h.core.create_bot("BTCUSDT", None).await.unwrap();
    h.core.refresh_symbol("BTCUSDT").await.unwrap();
    h.core.tick_bot("BTCUSDT").await.unwrap();

    let order_id = h.core.get_bot("BTCUSDT").unwrap().order_id.unwrap();
    h.exchange.cancel_order("BTCUSDT", &order_id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.entries_failed, 1);
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::Idle);
    h.cleanup().await;
}

#[tokio::test]
async fn test_missing_stop_is_rearmed() {
    let h = harness().await;
    open_long(&h, "BTCUSDT").await;

    let stop_id = h.core.get_bot("BTCUSDT").unwrap().stop_loss_order_id.unwrap();
    h.exchange.cancel_order("BTCUSDT", &stop_id).await.unwrap();

    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.stops_rearmed, 1);
    let new_stop = h.core.get_bot("BTCUSDT").unwrap().stop_loss_order_id.unwrap();
    assert_ne!(new_stop, stop_id);
    assert!(h.exchange.position("BTCUSDT").unwrap().stop_loss.is_some());
    h.cleanup().await;
}

#[tokio::test]
async fn test_side_mismatch_alerts_without_action() {
    let mut h = harness().await;
    open_long(&h, "BTCUSDT").await;

    h.exchange.close_externally("BTCUSDT");
    h.exchange.open_externally(ExchangePosition {
        symbol: "BTCUSDT".to_string(),
        side: Side::Short,
        size: 1.0,
        entry_price: 70.0,
        mark_price: Some(70.0),
        leverage: Some(1.0),
        stop_loss: Some(80.0),
    });
    h.drain();

    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.side_mismatches, 1);
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::InPositionLong);
    assert!(h.drain().iter().any(|e| e.kind() == "side_mismatch"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_external_position_adopted() {
    let mut h = harness().await;
    h.exchange.open_externally(ExchangePosition {
        symbol: "SOLUSDT".to_string(),
        side: Side::Short,
        size: 2.0,
        entry_price: 150.0,
        mark_price: Some(150.0),
        leverage: Some(1.0),
        stop_loss: None,
    });

    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.adopted, 1);

    let bot = h.core.get_bot("SOLUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::InPositionShort);
    assert!(!bot.opened_by_autobot);
    assert!(bot.order_id.unwrap().starts_with("adopted-"));
    assert!(bot.stop_loss_order_id.is_some());
    assert!(h.drain().iter().any(|e| e.kind() == "position_adopted"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_orphan_alerted_once_when_adoption_disabled() {
    let mut h = harness_with(
        AutoBotConfig {
            adopt_external_positions: false,
            ..config()
        },
        settings(),
    )
    .await;
    h.exchange.open_externally(ExchangePosition {
        symbol: "SOLUSDT".to_string(),
        side: Side::Long,
        size: 2.0,
        entry_price: 150.0,
        mark_price: None,
        leverage: None,
        stop_loss: None,
    });

    h.core.reconcile_once().await.unwrap();
    h.core.reconcile_once().await.unwrap();
    let orphans = h
        .drain()
        .iter()
        .filter(|e| e.kind() == "orphaned_position")
        .count();
    assert_eq!(orphans, 1);
    assert!(h.core.get_bot("SOLUSDT").is_none());
    h.cleanup().await;
}

#[tokio::test]
async fn test_reconcile_failures_alert_after_threshold() {
    let mut h = harness().await;
    h.exchange.fail_positions(true);
    h.drain();

    assert!(h.core.reconcile_once().await.is_err());
    assert!(!h.drain().iter().any(|e| e.kind() == "exchange_alert"));
    assert!(h.core.reconcile_once().await.is_err());
    assert!(h.drain().iter().any(|e| e.kind() == "exchange_alert"));

    h.exchange.fail_positions(false);
    assert!(h.core.reconcile_once().await.is_ok());
    h.cleanup().await;
}

#[tokio::test]
async fn test_autobot_creates_and_enters() {
    let mut h = harness_with(
        AutoBotConfig {
            enabled: true,
            ..config()
        },
        settings(),
    )
    .await;
    h.core.refresh_signals().await;

    let report = h.core.run_autobot().await;
    assert_eq!(report.created, vec!["BTCUSDT", "ETHUSDT"]);
    assert_eq!(report.entered.len(), 2);

    let bot = h.core.get_bot("BTCUSDT").unwrap();
    assert!(bot.opened_by_autobot);
    assert_eq!(bot.status, BotStatus::InPositionLong);
    assert!(h
        .drain()
        .iter()
        .any(|e| matches!(e, NotificationEvent::BotCreated { opened_by_autobot: true, .. })));

    // Closed auto-bots are removed, not reset
    h.exchange.set_price("BTCUSDT", 50.0);
    h.core.refresh_symbol("BTCUSDT").await.unwrap();
    h.core.tick_bot("BTCUSDT").await.unwrap();
    assert!(h.core.get_bot("BTCUSDT").is_none());
    assert_eq!(h.core.stats().total_trades, 1);
    h.cleanup().await;
}

#[tokio::test]
async fn test_autobot_respects_cap() {
    let h = harness_with(
        AutoBotConfig {
            enabled: true,
            max_concurrent_bots: 1,
            ..config()
        },
        settings(),
    )
    .await;
    h.core.refresh_signals().await;

    let report = h.core.run_autobot().await;
    assert_eq!(report.created, vec!["BTCUSDT"]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "ETHUSDT");
    h.cleanup().await;
}

#[tokio::test]
async fn test_inactive_autobot_cleaned_up() {
    let mut h = harness_with(
        AutoBotConfig {
            inactive_bot_timeout_minutes: 30,
            ..config()
        },
        settings(),
    )
    .await;
    let settings = BotSettings {
        volume_mode: VolumeMode::Usdt,
        volume_value: 10.0,
    };
    let stale = Bot::new("ETHUSDT", settings.clone(), true, Utc::now() - Duration::hours(1));
    h.core.registry.insert_new(stale, |_| Ok(())).unwrap();
    h.core
        .registry
        .insert_new(Bot::new("XRPUSDT", settings, false, Utc::now() - Duration::hours(1)), |_| Ok(()))
        .unwrap();

    let report = h.core.run_autobot().await;
    assert_eq!(report.cleaned_up, vec!["ETHUSDT"]);
    assert!(h.core.get_bot("ETHUSDT").is_none());
    // Manual bots are never cleaned up
    assert!(h.core.get_bot("XRPUSDT").is_some());
    assert!(h
        .drain()
        .iter()
        .any(|e| matches!(e, NotificationEvent::BotStopped { symbol, .. } if symbol == "ETHUSDT")));
    h.cleanup().await;
}

#[tokio::test]
async fn test_create_bot_validation() {
    let h = harness().await;
    assert_eq!(
        h.core.create_bot("", None).await.unwrap_err().code(),
        "INVALID_CONFIG"
    );
    let bad = BotSettings {
        volume_mode: VolumeMode::Coins,
        volume_value: 0.0,
    };
    assert_eq!(
        h.core.create_bot("BTCUSDT", Some(bad)).await.unwrap_err().code(),
        "INVALID_CONFIG"
    );

    let bot = h.core.create_bot("btcusdt", None).await.unwrap();
    assert_eq!(bot.symbol, "BTCUSDT");
    assert_eq!(
        h.core.create_bot("BTCUSDT", None).await.unwrap_err().code(),
        "BOT_ALREADY_EXISTS"
    );
    assert_eq!(h.core.stop_bot("ETHUSDT").await.unwrap_err().code(), "BOT_NOT_FOUND");
    h.cleanup().await;
}

#[tokio::test]
async fn test_update_auto_bot_config_validates_and_persists() {
    let h = harness().await;
    let invalid = AutoBotConfig {
        rsi_oversold: 80.0,
        rsi_overbought: 70.0,
        ..config()
    };
    assert_eq!(
        h.core.update_auto_bot_config(invalid).await.unwrap_err().code(),
        "INVALID_CONFIG"
    );

    let updated = AutoBotConfig {
        max_concurrent_bots: 2,
        ..config()
    };
    h.core.update_auto_bot_config(updated.clone()).await.unwrap();
    assert_eq!(*h.core.auto_bot_config(), updated);

    let saved = tokio::fs::read(h.dir.join("state.json")).await.unwrap();
    let saved: serde_json::Value = serde_json::from_slice(&saved).unwrap();
    assert_eq!(saved["autobot"]["max_concurrent_bots"], 2);
    h.cleanup().await;
}

#[tokio::test]
async fn test_get_signal_uses_cache_then_refreshes() {
    let h = harness().await;
    let first = h.core.get_signal("BTCUSDT").await.unwrap();
    assert_eq!(first.signal, Signal::EnterLong);
    let cached = h.core.get_signal("BTCUSDT").await.unwrap();
    assert_eq!(cached.computed_at, first.computed_at);
    h.cleanup().await;
}

#[tokio::test]
async fn test_trade_recorded_in_history() {
    let h = harness().await;
    open_long(&h, "BTCUSDT").await;
    h.exchange.set_price("BTCUSDT", 77.0);
    h.core.refresh_symbol("BTCUSDT").await.unwrap();
    h.core.tick_bot("BTCUSDT").await.unwrap();
    h.core.stop_bot("BTCUSDT").await.unwrap();

    let trades = h.core.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, ExitReason::Manual);
    assert!((trades[0].realized_pnl_percent - 10.0).abs() < 1e-9);

    let history = JsonlTradeHistory::open(h.dir.join("trades.jsonl")).await.unwrap();
    assert_eq!(history.recent(10).await.unwrap().len(), 1);
    h.cleanup().await;
}

/// History store whose writes can be switched off
struct FlakyHistory {
    inner: JsonlTradeHistory,
    failing: AtomicBool,
}

#[async_trait]
impl TradeHistory for FlakyHistory {
    async fn append(&self, record: &TradeRecord) -> crate::Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TradingError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.append(record).await
    }

    async fn recent(&self, limit: usize) -> crate::Result<Vec<TradeRecord>> {
        self.inner.recent(limit).await
    }
}

fn external_position(symbol: &str, side: Side) -> ExchangePosition {
    ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size: 1.0,
        entry_price: 70.0,
        mark_price: Some(70.0),
        leverage: Some(1.0),
        stop_loss: None,
    }
}

#[tokio::test]
async fn test_idle_bot_takes_over_external_position() {
    let mut h = harness().await;
    h.core.create_bot("ETHUSDT", None).await.unwrap();
    h.exchange.open_externally(external_position("ETHUSDT", Side::Long));

    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.adopted, 1);
    let bot = h.core.get_bot("ETHUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::InPositionLong);
    assert!(bot.stop_loss_order_id.is_some());
    assert!(h.drain().iter().any(|e| e.kind() == "position_adopted"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_idle_takeover_respects_concurrency_cap() {
    let mut h = harness_with(
        AutoBotConfig {
            max_concurrent_bots: 1,
            ..config()
        },
        settings(),
    )
    .await;
    open_long(&h, "BTCUSDT").await;
    h.core.create_bot("ETHUSDT", None).await.unwrap();
    h.exchange.open_externally(external_position("ETHUSDT", Side::Long));
    h.drain();

    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.adopted, 0);
    assert_eq!(report.orphaned, 1);
    assert_eq!(h.core.get_bot("ETHUSDT").unwrap().status, BotStatus::Idle);
    let in_position = h
        .core
        .list_bots()
        .iter()
        .filter(|b| b.is_in_position())
        .count();
    assert_eq!(in_position, 1);

    let kinds: Vec<_> = h.drain().iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&"orphaned_position"));
    assert!(!kinds.contains(&"position_adopted"));

    // Alerted once while the position stays
    h.core.reconcile_once().await.unwrap();
    assert!(!h.drain().iter().any(|e| e.kind() == "orphaned_position"));
    h.cleanup().await;
}

#[tokio::test]
async fn test_stale_snapshot_skips_bot_that_moved() {
    let h = harness().await;
    let snapshot = h.core.fetch_snapshot().await.unwrap();
    assert!(snapshot.positions.is_empty());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // The bot opens after the exchange view was taken
    open_long(&h, "BTCUSDT").await;
    let report = h.core.apply_snapshot(&snapshot).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.external_closes, 0);
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::InPositionLong);
    assert!(h.core.recent_trades(10).await.unwrap().is_empty());
    assert_eq!(h.core.stats().total_trades, 0);

    // A fresh view sees the position and leaves the bot alone
    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.skipped, 0);
    assert_eq!(report.external_closes, 0);
    h.cleanup().await;
}

#[tokio::test]
async fn test_trade_parked_until_history_accepts_it() {
    let dir = test_dir();
    let history = Arc::new(FlakyHistory {
        inner: JsonlTradeHistory::open(dir.join("trades.jsonl")).await.unwrap(),
        failing: AtomicBool::new(false),
    });
    let h = harness_on(dir, config(), settings(), history.clone()).await;
    open_long(&h, "BTCUSDT").await;

    history.failing.store(true, Ordering::SeqCst);
    h.exchange.close_externally("BTCUSDT");
    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.external_closes, 1);
    assert_eq!(report.trades_recovered, 0);
    assert!(h.core.recent_trades(10).await.unwrap().is_empty());
    assert_eq!(h.core.stats().total_trades, 0);

    let saved = tokio::fs::read(h.dir.join("state.json")).await.unwrap();
    let saved: serde_json::Value = serde_json::from_slice(&saved).unwrap();
    assert_eq!(saved["pending_trades"].as_array().map(Vec::len), Some(1));
    assert_eq!(saved["pending_trades"][0]["symbol"], "BTCUSDT");

    history.failing.store(false, Ordering::SeqCst);
    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.trades_recovered, 1);
    assert_eq!(h.core.recent_trades(10).await.unwrap().len(), 1);
    assert_eq!(h.core.stats().total_trades, 1);

    let saved = tokio::fs::read(h.dir.join("state.json")).await.unwrap();
    let saved: serde_json::Value = serde_json::from_slice(&saved).unwrap();
    assert!(saved.get("pending_trades").is_none());

    // Nothing left to retry
    let report = h.core.reconcile_once().await.unwrap();
    assert_eq!(report.trades_recovered, 0);
    assert_eq!(h.core.stats().total_trades, 1);
    h.cleanup().await;
}

#[tokio::test]
async fn test_tick_prices_open_position_from_exchange() {
    let h = harness().await;
    open_long(&h, "BTCUSDT").await;

    // No signal refresh: the buffered price is still the entry price
    h.exchange.set_price("BTCUSDT", 58.8);
    assert_eq!(h.core.candles.last_price("BTCUSDT"), Some(70.0));

    let outcome = h.core.tick_bot("BTCUSDT").await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Closed {
            reason: ExitReason::StopLoss
        }
    );
    assert_eq!(h.core.get_bot("BTCUSDT").unwrap().status, BotStatus::Idle);
    h.cleanup().await;
}
