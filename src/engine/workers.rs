use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use super::trading_core::TradingCore;

/// Handles of the background loops, stopped together
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Run `step` every `period` until shutdown is signalled
///
/// A step still running when the next tick is due makes that tick skip.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    start_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut step: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tracing::info!("{} loop starting (every {:?})", name, period);
        let mut ticker = interval_at(Instant::now() + start_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => step().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("{} loop stopped", name);
    })
}

impl Workers {
    /// Spawn the signal, bot, reconciliation and auto-bot loops
    pub fn spawn(core: Arc<TradingCore>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let settings = core.settings.clone();
        let secs = |s: u64| Duration::from_secs(s.max(1));

        let mut handles = Vec::new();

        let c = Arc::clone(&core);
        handles.push((
            "signals",
            spawn_loop("Signal refresh", secs(settings.signal_refresh_secs), Duration::ZERO, rx.clone(), move || {
                let core = Arc::clone(&c);
                async move {
                    core.refresh_signals().await;
                }
            }),
        ));

        let c = Arc::clone(&core);
        handles.push((
            "reconcile",
            spawn_loop("Reconciliation", secs(settings.reconcile_secs), secs(settings.reconcile_secs), rx.clone(), move || {
                let core = Arc::clone(&c);
                async move {
                    if let Err(e) = core.reconcile_once().await {
                        tracing::debug!("Reconciliation pass failed: {}", e);
                    }
                }
            }),
        ));

        // Bots and the orchestrator start after the first signals are in
        let c = Arc::clone(&core);
        handles.push((
            "bots",
            spawn_loop("Bot tick", secs(settings.bot_tick_secs), secs(settings.bot_tick_secs), rx.clone(), move || {
                let core = Arc::clone(&c);
                async move {
                    core.tick_all().await;
                }
            }),
        ));

        let c = Arc::clone(&core);
        handles.push((
            "autobot",
            spawn_loop("Auto-bot", secs(settings.autobot_secs), secs(settings.autobot_secs), rx, move || {
                let core = Arc::clone(&c);
                async move {
                    let report = core.run_autobot().await;
                    if !report.created.is_empty() || !report.cleaned_up.is_empty() {
                        tracing::info!(
                            "Auto-bot: created {:?}, cleaned up {:?}",
                            report.created,
                            report.cleaned_up
                        );
                    }
                }
            }),
        ));

        Self { shutdown, handles }
    }

    /// Signal every loop and wait for them to finish their current step
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("{} worker ended abnormally: {}", name, e);
            }
        }
    }
}
