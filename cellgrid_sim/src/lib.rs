//! CellGrid Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled environment where the turn controller
//! runs against an in-process engine and a virtual clock.
//!
//! # Core Principle: The Reactor Pattern
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the scenario says so
//! - **Engine**: In-process rules with scriptable failures and latency
//! - **Randomness**: All entropy derived from a single 64-bit seed
//! - **Scheduling**: A single-threaded runtime, with race orderings drawn from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                      │
//! │  ┌──────────────┐   submit / join   ┌───────────────┐  │
//! │  │   Scenario   │──────────────────►│ TurnController│  │
//! │  │  (seeded)    │◄──── events ──────│               │  │
//! │  └──────┬───────┘                   └───┬───────┬───┘  │
//! │         │ advance_time        sleep     │       │      │
//! │  ┌──────▼───────┐◄──────────────────────┘       │      │
//! │  │  SimContext  │                   ┌───────────▼───┐  │
//! │  │ (virtual clk)│                   │   SimEngine   │  │
//! │  └──────────────┘                   └───────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cellgrid_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::DeadlineRace);
//! assert!(result.passed);
//! ```

mod context;
mod engine;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use engine::{AnimationStep, SimEngine, StepResult};
pub use runner::{ScenarioFailure, ScenarioMetrics, ScenarioResult, ScenarioRunner};
