//! Simulation engine boundary for the turn controller.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{CellMove, InitRequest, TurnOutcome, WorldGrid};

/// Request/response adapter to the external simulation engine.
///
/// # Implementations
///
/// - **Production**: `HttpGateway` - JSON over HTTP to the engine service
/// - **Simulation**: `SimEngine` - in-process engine with fault injection
///
/// # Call Flow
///
/// ```text
/// TurnController              Gateway                   Engine
///   |                           |                          |
///   |-- initialize(req) ------->|-- POST /init ----------->|
///   |<------------- grid -------|<-------------------------|
///   |                           |                          |
///   |-- compute_turn(moves) --->|-- POST /moves ---------->|
///   |<-- (animation, cells) ----|<-------------------------|
/// ```
///
/// Implementations perform no retries and hold no orchestration state.
/// Retry policy belongs to the caller.
#[async_trait]
pub trait SimulationGateway: Send + Sync + 'static {
    /// Creates a new world for the given roster and parameters.
    ///
    /// # Returns
    /// * `Ok(grid)` - The initial world
    /// * `Err(EnvError)` - Engine unreachable, timed out, or answered garbage
    async fn initialize(&self, request: &InitRequest) -> Result<WorldGrid, EnvError>;

    /// Advances the engine's world by one turn using the flattened moves of
    /// every player.
    ///
    /// # Returns
    /// * `Ok(outcome)` - Animation trace plus the new occupied cells
    /// * `Err(EnvError)` - Engine unreachable, timed out, or answered garbage
    async fn compute_turn(&self, moves: &[CellMove]) -> Result<TurnOutcome, EnvError>;
}
