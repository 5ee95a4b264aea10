use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_test::{assert_err, assert_ok};

use rsibot::config::{AutoBotConfig, EngineSettings, VolumeMode};
use rsibot::engine::TickOutcome;
use rsibot::exchange::PaperExchange;
use rsibot::notify::TracingNotifier;
use rsibot::persistence::{FileMaturityStore, JsonFileStore, JsonlTradeHistory};
use rsibot::*;

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("rsibot-e2e-{}", uuid::Uuid::new_v4()))
}

fn autobot_config() -> AutoBotConfig {
    AutoBotConfig {
        timeframe: Timeframe::H1,
        min_candles_for_maturity: 30,
        time_filter_enabled: false,
        avoid_down_trend: false,
        avoid_up_trend: false,
        ..Default::default()
    }
}

fn engine_settings() -> EngineSettings {
    EngineSettings {
        lock_timeout_ms: 500,
        exchange_timeout_secs: 2,
        exchange_max_retries: 1,
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

/// Hourly candles falling 0.5 per candle down to 70; the newest is still forming
fn oversold_candles() -> Vec<Candle> {
    let now = Utc::now();
    let count = 61;
    (0..count)
        .map(|i| {
            let close = 100.0 - i as f64 * 0.5;
            Candle {
                open_time: now - Duration::minutes(30) - Duration::hours((count - 1 - i) as i64),
                open: close + 0.5,
                high: close + 0.6,
                low: close - 0.1,
                close,
                volume: 5000.0,
            }
        })
        .collect()
}

fn paper_exchange() -> Arc<PaperExchange> {
    let exchange = Arc::new(PaperExchange::new(10_000.0, 1.0));
    for symbol in ["BTCUSDT", "ETHUSDT", "XRPUSDT"] {
        exchange.set_candles(symbol, oversold_candles());
    }
    exchange
}

async fn start_core(
    dir: &Path,
    exchange: Arc<PaperExchange>,
    config: AutoBotConfig,
) -> rsibot::Result<Arc<TradingCore>> {
    let deps = CoreDeps {
        exchange,
        store: Arc::new(JsonFileStore::new(dir.join("bots_state.json"))),
        maturity: Arc::new(FileMaturityStore::open(dir.join("mature_coins.json")).await?),
        history: Arc::new(JsonlTradeHistory::open(dir.join("trade_history.jsonl")).await?),
        notifier: Arc::new(TracingNotifier),
    };
    TradingCore::start(
        deps,
        engine_settings(),
        config,
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "XRPUSDT".to_string()],
    )
    .await
}

async fn open_long(core: &TradingCore, symbol: &str) {
    core.create_bot(symbol, None).await.unwrap();
    core.refresh_symbol(symbol).await.unwrap();
    let outcome = core.tick_bot(symbol).await.unwrap();
    assert!(
        matches!(outcome, TickOutcome::Entered { side: Side::Long, .. }),
        "unexpected tick outcome {:?}",
        outcome
    );
}

#[tokio::test]
async fn test_e2e_full_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = temp_dir();
    let exchange = paper_exchange();
    let core = start_core(&dir, exchange.clone(), autobot_config()).await.unwrap();

    println!("1. Signal on oversold history");
    let signal = core.get_signal("BTCUSDT").await.unwrap();
    assert_eq!(signal.signal, Signal::EnterLong);
    assert_eq!(signal.rsi, Some(0.0));
    assert_eq!(signal.closed_candles, 60);

    println!("2. Bot enters long");
    open_long(&core, "BTCUSDT").await;
    let bot = core.get_bot("BTCUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::InPositionLong);
    assert_eq!(bot.entry_price, Some(70.0));
    assert!(exchange.position("BTCUSDT").is_some());

    println!("3. Price drops 16%, stop-loss fires");
    exchange.set_price("BTCUSDT", 58.8);
    core.refresh_symbol("BTCUSDT").await.unwrap();
    let outcome = core.tick_bot("BTCUSDT").await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Closed {
            reason: ExitReason::StopLoss
        }
    );

    println!("4. Manual bot is reusable, trade is recorded");
    let bot = core.get_bot("BTCUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::Idle);
    assert!(exchange.position("BTCUSDT").is_none());

    let trades = core.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, ExitReason::StopLoss);
    assert!((trades[0].realized_pnl_percent + 16.0).abs() < 1e-9);

    let stats = core.stats();
    assert_eq!(stats.total_trades, 1);
    assert_eq!(stats.losing_trades, 1);
    assert_eq!(stats.consecutive_losses, 1);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_e2e_concurrent_create_has_one_winner() {
    let dir = temp_dir();
    let core = start_core(&dir, paper_exchange(), autobot_config()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let core = Arc::clone(&core);
        handles.push(tokio::spawn(async move { core.create_bot("ETHUSDT", None).await }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(TradingError::BotAlreadyExists(_)) => duplicates += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(duplicates, 15);
    assert_eq!(core.list_bots().len(), 1);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_e2e_external_close_recorded_once() {
    let dir = temp_dir();
    let exchange = paper_exchange();
    let core = start_core(&dir, exchange.clone(), autobot_config()).await.unwrap();
    open_long(&core, "BTCUSDT").await;

    exchange.set_price("BTCUSDT", 72.0);
    core.refresh_symbol("BTCUSDT").await.unwrap();
    core.tick_bot("BTCUSDT").await.unwrap();
    exchange.close_externally("BTCUSDT").unwrap();

    let report = core.reconcile_once().await.unwrap();
    assert_eq!(report.external_closes, 1);
    // A second pass finds nothing left to do
    let report = core.reconcile_once().await.unwrap();
    assert_eq!(report.external_closes, 0);

    let bot = core.get_bot("BTCUSDT").unwrap();
    assert_eq!(bot.status, BotStatus::Idle);

    let trades = core.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, ExitReason::ExternalClose);
    assert_eq!(trades[0].exit_price, 72.0);
    assert_eq!(core.stats().total_trades, 1);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_e2e_restart_restores_bots() {
    let dir = temp_dir();
    let exchange = paper_exchange();
    let core = start_core(&dir, exchange.clone(), autobot_config()).await.unwrap();

    open_long(&core, "BTCUSDT").await;
    core.create_bot("ETHUSDT", None).await.unwrap();
    core.create_bot(
        "XRPUSDT",
        Some(BotSettings {
            volume_mode: VolumeMode::Coins,
            volume_value: 3.0,
        }),
    )
    .await
    .unwrap();
    let before = serde_json::to_value(core.list_bots()).unwrap();
    drop(core);

    let restarted = start_core(&dir, exchange, autobot_config()).await.unwrap();
    assert!(restarted.is_reconciled());

    let after = serde_json::to_value(restarted.list_bots()).unwrap();
    assert_eq!(restarted.list_bots().len(), 3);
    assert_eq!(before, after);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_e2e_maturity_gate_blocks_entries() {
    let dir = temp_dir();
    let config = AutoBotConfig {
        min_candles_for_maturity: 400,
        ..autobot_config()
    };
    let core = start_core(&dir, paper_exchange(), config).await.unwrap();

    let signal = core.get_signal("BTCUSDT").await.unwrap();
    assert_eq!(signal.rsi, Some(0.0));
    assert_eq!(signal.signal, Signal::NoSignal);
    assert!(signal.blocked_by.unwrap().contains("immature"));

    core.create_bot("BTCUSDT", None).await.unwrap();
    let outcome = core.tick_bot("BTCUSDT").await.unwrap();
    assert_eq!(outcome, TickOutcome::Held);
    assert_eq!(core.get_bot("BTCUSDT").unwrap().status, BotStatus::Idle);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_e2e_corrupted_entry_is_quarantined() {
    let dir = temp_dir();
    let exchange = paper_exchange();
    let core = start_core(&dir, exchange.clone(), autobot_config()).await.unwrap();
    core.create_bot("BTCUSDT", None).await.unwrap();
    drop(core);

    // Damage one entry by hand
    let path = dir.join("bots_state.json");
    let mut state: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    state["bots"]["ETHUSDT"] = serde_json::json!({
        "symbol": "ETHUSDT",
        "status": "IN_POSITION_LONG"
    });
    tokio::fs::write(&path, serde_json::to_vec(&state).unwrap())
        .await
        .unwrap();

    let core = start_core(&dir, exchange.clone(), autobot_config()).await.unwrap();
    assert_eq!(core.list_bots().len(), 1);
    let quarantined = core.quarantined();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].symbol, "ETHUSDT");

    let err = assert_err!(core.create_bot("ETHUSDT", None).await);
    assert_eq!(err.code(), "STATE_CORRUPTED");

    // The raw entry survives saves until resolved
    core.persist().await.unwrap();
    let saved: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    assert_eq!(saved["bots"]["ETHUSDT"]["status"], "IN_POSITION_LONG");

    let released = assert_ok!(core.resolve_corrupted("ETHUSDT").await);
    assert!(released.reason.contains("undecodable"));
    assert_ok!(core.create_bot("ETHUSDT", None).await);
    assert!(core.quarantined().is_empty());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_e2e_unreadable_state_refuses_start() {
    let dir = temp_dir();
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("bots_state.json"), b"{ not json")
        .await
        .unwrap();

    let err = match start_core(&dir, paper_exchange(), autobot_config()).await {
        Ok(_) => panic!("core started on a corrupted state file"),
        Err(e) => e,
    };
    assert!(matches!(err, TradingError::StateCorrupted { .. }));
    assert_eq!(err.code(), "STATE_CORRUPTED");

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
