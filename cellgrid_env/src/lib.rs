//! CellGrid Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the CellGrid turn
//! controller to run in both **Production** (tokio + HTTP engine) and
//! **Simulation** (virtual clock + in-process engine) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! For Deterministic Simulation Testing (DST), we intercept all I/O:
//! - Time (`now()`, `sleep()`) - drives turn deadlines
//! - Tasks (`spawn()`) - deadline timers run as background tasks
//! - The simulation engine (`SimulationGateway`)
//!
//! # Example
//!
//! ```ignore
//! use cellgrid_env::{GameContext, SimulationGateway};
//!
//! async fn deadline<Ctx: GameContext>(ctx: &Ctx, secs: u64) {
//!     ctx.sleep(Duration::from_secs(secs)).await;
//!     // finalize the turn armed for this deadline
//! }
//! ```

mod context;
mod gateway;
mod http_gateway;
mod types;
mod error;
mod tokio_impl;

pub use context::GameContext;
pub use gateway::SimulationGateway;
pub use http_gateway::HttpGateway;
pub use types::{Cell, CellMove, Direction, InitRequest, TurnOutcome, WorldGrid, VITAMIN_OWNER};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
