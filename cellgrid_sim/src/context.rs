//! Simulation context implementing GameContext for deterministic testing.

use async_trait::async_trait;
use cellgrid_env::GameContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

/// Simulation context backed by a virtual clock.
///
/// This implements `GameContext` using:
/// - A virtual clock that only moves when the harness advances it
/// - Simulated sleep that waits for the virtual clock to reach its target
/// - A fixed master seed handed to everything that needs randomness
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    clock: Arc<watch::Sender<u64>>,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(0);
        Self {
            seed,
            clock: Arc::new(clock),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time, waking every sleeper whose target has passed.
    pub fn advance_time(&self, duration: Duration) {
        let step = nanos(duration);
        self.clock.send_modify(|t| *t = t.saturating_add(step));
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.clock.borrow()
    }

    /// Number of tasks currently blocked in `sleep`.
    pub fn sleepers(&self) -> usize {
        self.clock.receiver_count()
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
        }
    }
}

#[async_trait]
impl GameContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let target = self.time_ns().saturating_add(nanos(duration));
        let mut rx = self.clock.subscribe();
        // Err means the clock was dropped; nothing left to wait for.
        let _ = rx.wait_for(|t| *t >= target).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
