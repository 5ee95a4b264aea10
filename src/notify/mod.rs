//! Fire-and-forget notifications for bot transitions and operator alerts.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::bots::{ExitReason, TradeRecord};
use crate::models::Side;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum NotificationEvent {
    BotCreated {
        symbol: String,
        opened_by_autobot: bool,
    },
    EntryPlaced {
        symbol: String,
        side: Side,
        order_id: String,
    },
    PositionOpened {
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
    },
    EntryFailed {
        symbol: String,
        reason: String,
    },
    StopLossArmed {
        symbol: String,
        trigger_price: f64,
    },
    ExitTriggered {
        symbol: String,
        reason: ExitReason,
        price: f64,
    },
    CloseFailed {
        symbol: String,
        attempts: u32,
        reason: String,
    },
    PositionClosed {
        trade: TradeRecord,
    },
    BotStopped {
        symbol: String,
        reason: String,
    },
    PositionAdopted {
        symbol: String,
        side: Side,
        size: f64,
    },
    OrphanedPosition {
        symbol: String,
        side: Side,
        size: f64,
    },
    SideMismatch {
        symbol: String,
        bot_side: Side,
        exchange_side: Side,
    },
    ExchangeAlert {
        consecutive_failures: u32,
        error: String,
    },
    StateQuarantined {
        symbol: String,
        reason: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::BotCreated { .. } => "bot_created",
            NotificationEvent::EntryPlaced { .. } => "entry_placed",
            NotificationEvent::PositionOpened { .. } => "position_opened",
            NotificationEvent::EntryFailed { .. } => "entry_failed",
            NotificationEvent::StopLossArmed { .. } => "stop_loss_armed",
            NotificationEvent::ExitTriggered { .. } => "exit_triggered",
            NotificationEvent::CloseFailed { .. } => "close_failed",
            NotificationEvent::PositionClosed { .. } => "position_closed",
            NotificationEvent::BotStopped { .. } => "bot_stopped",
            NotificationEvent::PositionAdopted { .. } => "position_adopted",
            NotificationEvent::OrphanedPosition { .. } => "orphaned_position",
            NotificationEvent::SideMismatch { .. } => "side_mismatch",
            NotificationEvent::ExchangeAlert { .. } => "exchange_alert",
            NotificationEvent::StateQuarantined { .. } => "state_quarantined",
        }
    }

    /// Needs an operator's attention
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            NotificationEvent::EntryFailed { .. }
                | NotificationEvent::CloseFailed { .. }
                | NotificationEvent::OrphanedPosition { .. }
                | NotificationEvent::SideMismatch { .. }
                | NotificationEvent::ExchangeAlert { .. }
                | NotificationEvent::StateQuarantined { .. }
        )
    }
}

/// Delivery must never block or fail the caller
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

/// Writes every event to the log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: NotificationEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        if event.is_alert() {
            tracing::warn!(kind = event.kind(), "{}", payload);
        } else {
            tracing::info!(kind = event.kind(), "{}", payload);
        }
    }
}

/// Publishes events to subscribers; events sent while nobody listens are dropped
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: NotificationEvent) {
        let _ = self.tx.send(event);
    }
}

/// Fan out to several notifiers
pub struct MultiNotifier(pub Vec<Box<dyn Notifier>>);

impl Notifier for MultiNotifier {
    fn notify(&self, event: NotificationEvent) {
        for notifier in &self.0 {
            notifier.notify(event.clone());
        }
    }
}
