//! CellGrid Core - Turn Orchestration for a Multiplayer Grid Game
//!
//! This library coordinates turn-based play between many clients and a
//! stateless simulation engine:
//! 1. **Who plays**: [`PlayerRegistry`] tracks connected names and freezes a [`Roster`] at start
//! 2. **When a turn ends**: [`TurnClock`] deadlines and roster completion race through one guard
//! 3. **What gets sent**: [`MoveAggregator`] keeps the latest submission per player
//!
//! The [`TurnController`] owns all three, calls the engine through a
//! [`cellgrid_env::SimulationGateway`] and announces every transition on a
//! [`BroadcastChannel`].

pub mod aggregator;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod registry;

// Re-export key types for convenience
pub use aggregator::{MoveAggregator, MoveSubmission, PutOutcome};
pub use broadcast::{BroadcastChannel, GameEvent};
pub use clock::{DeadlineFiring, TurnClock};
pub use config::{BeginParams, ControllerConfig, GameConfig, MAX_TURN_DEADLINE_SECS};
pub use controller::{GameSnapshot, Phase, SubmitAck, Trigger, TurnController};
pub use error::{OrchestratorError, OrchestratorResult};
pub use registry::{Player, PlayerRegistry, Roster};
