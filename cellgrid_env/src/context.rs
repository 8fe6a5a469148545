//! Core environment context trait for CellGrid orchestration.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the turn controller can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` - virtual clock advanced by the test harness
///
/// # Determinism
///
/// Turn deadlines are the only timing-dependent behaviour in the controller.
/// Routing them through `sleep()` lets the simulation decide exactly when a
/// deadline fires relative to submissions.
#[async_trait]
pub trait GameContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for join timestamps and deadline bookkeeping.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: resolves once the virtual clock has been advanced past
    /// the wake-up point
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// The `name` is attached to the task's tracing span.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed, logged when a game starts.
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
