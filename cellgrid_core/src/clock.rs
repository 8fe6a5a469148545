//! Turn deadline timer.
//!
//! Each open turn owns at most one deadline. Arming a new deadline cancels the
//! previous one, and every firing carries the turn number and generation it
//! was armed with so that a timer from an older turn can never close a newer
//! one.

use cellgrid_env::GameContext;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Token delivered to the `on_fire` callback when a deadline elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineFiring {
    /// Turn the deadline was armed for
    pub turn: u64,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct ArmedDeadline {
    turn: u64,
    generation: u64,
    deadline_at: Duration,
}

/// Cancelable per-turn deadline.
#[derive(Debug, Default)]
pub struct TurnClock {
    /// Bumped on every arm/cancel; a sleeping timer compares against it
    generation: Arc<AtomicU64>,
    armed: Option<ArmedDeadline>,
}

impl TurnClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a deadline of `seconds` for `turn`, cancelling any earlier one.
    ///
    /// With `seconds == 0` no timer is created and `None` is returned.
    /// Otherwise returns the context time at which the deadline elapses.
    pub fn arm<Ctx, F, Fut>(
        &mut self,
        ctx: &Arc<Ctx>,
        turn: u64,
        seconds: u64,
        on_fire: F,
    ) -> Option<Duration>
    where
        Ctx: GameContext,
        F: FnOnce(DeadlineFiring) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        if seconds == 0 {
            return None;
        }

        let duration = Duration::from_secs(seconds);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline_at = ctx.now().saturating_add(duration);
        self.armed = Some(ArmedDeadline {
            turn,
            generation,
            deadline_at,
        });

        let token = Arc::clone(&self.generation);
        let sleeper = Arc::clone(ctx);
        ctx.spawn(&format!("deadline-turn-{turn}"), async move {
            sleeper.sleep(duration).await;
            if token.load(Ordering::SeqCst) != generation {
                debug!(turn, "deadline cancelled before firing");
                return;
            }
            on_fire(DeadlineFiring { turn, generation }).await;
        });

        Some(deadline_at)
    }

    /// Cancels the armed deadline. Safe to call at any time.
    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            debug!(turn = armed.turn, "deadline cancelled");
        }
    }

    /// Returns true if `firing` belongs to the currently armed deadline.
    pub fn is_current(&self, firing: &DeadlineFiring) -> bool {
        self.armed
            .map(|a| a.turn == firing.turn && a.generation == firing.generation)
            .unwrap_or(false)
    }

    /// Turn the armed deadline belongs to.
    pub fn armed_turn(&self) -> Option<u64> {
        self.armed.map(|a| a.turn)
    }

    /// Context time at which the armed deadline elapses.
    pub fn deadline_at(&self) -> Option<Duration> {
        self.armed.map(|a| a.deadline_at)
    }
}
