//! Fan-out of game events to subscribed observers.

use crate::config::GameConfig;
use cellgrid_env::WorldGrid;
use serde::Serialize;
use tokio::sync::broadcast;

/// Events published by the turn controller.
///
/// Serialized as `{"event": "<name>", ...fields}` with camelCase field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GameEvent {
    /// A player joined; carries the updated connected list
    PlayerJoined { players: Vec<String> },

    /// A turn is open for submissions
    TurnOpened {
        turn_number: u64,
        config: GameConfig,
        current_grid: WorldGrid,
    },

    /// A turn was computed by the engine
    TurnResult {
        turn_number: u64,
        animation_trace: serde_json::Value,
        config: GameConfig,
    },

    /// The engine failed for a turn; the previous grid was kept
    TurnDegraded {
        turn_number: u64,
        attempts: u32,
        reason: String,
    },
}

impl GameEvent {
    /// Event name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::PlayerJoined { .. } => "playerJoined",
            GameEvent::TurnOpened { .. } => "turnOpened",
            GameEvent::TurnResult { .. } => "turnResult",
            GameEvent::TurnDegraded { .. } => "turnDegraded",
        }
    }

    /// Turn this event belongs to, if any.
    pub fn turn_number(&self) -> Option<u64> {
        match self {
            GameEvent::PlayerJoined { .. } => None,
            GameEvent::TurnOpened { turn_number, .. }
            | GameEvent::TurnResult { turn_number, .. }
            | GameEvent::TurnDegraded { turn_number, .. } => Some(*turn_number),
        }
    }
}

/// Best-effort publisher. Publishing never blocks and never fails.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<GameEvent>,
}

impl BroadcastChannel {
    /// Creates a channel buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to every event published from now on.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// `RecvError::Lagged` and skips ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event, returning how many subscribers received it.
    pub fn publish(&self, event: GameEvent) -> usize {
        // Err only means nobody is listening.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
