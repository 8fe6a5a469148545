//! Scenario runner - drives the turn controller through deterministic scenarios.

use crate::context::SimContext;
use crate::engine::SimEngine;
use crate::scenarios::ScenarioId;

use cellgrid_core::{
    ControllerConfig, GameConfig, GameEvent, OrchestratorError, TurnController,
};
use cellgrid_env::{CellMove, GameContext, WorldGrid};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

type SimController = TurnController<SimContext, SimEngine>;

/// Yields granted to spawned tasks before the harness looks at state again.
const SETTLE_YIELDS: usize = 32;

/// Upper bound on yields while waiting for a turn to open.
const MAX_WAIT_YIELDS: usize = 10_000;

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioFailure {
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("unexpected controller error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("runtime error: {0}")]
    Runtime(String),
}

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Result<(), ScenarioFailure> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioFailure::Invariant(reason()))
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Turn the controller was on when the scenario ended
    pub final_turn: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// `compute_turn` calls received by the engine, failures included
    pub engine_calls: u64,

    /// Turns the controller finalized
    pub finalized_turns: u64,

    /// Turns that fell back to the previous grid
    pub degraded_turns: u64,

    /// Submissions the controller refused
    pub rejected_submissions: u64,

    /// Events observed on the broadcast channel
    pub events_seen: usize,
}

/// One controller, one engine, one virtual clock.
struct Harness {
    context: Arc<SimContext>,
    engine: Arc<SimEngine>,
    controller: SimController,
    config: ControllerConfig,
    events: broadcast::Receiver<GameEvent>,
    rng: ChaCha8Rng,
    rejected: u64,
    seen: Vec<GameEvent>,
}

impl Harness {
    fn new(seed: u64, config: ControllerConfig) -> Self {
        // Derive separate seeds for different subsystems
        let engine_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);
        let schedule_seed = seed.wrapping_mul(0x517cc1b727220a95);

        let context = SimContext::shared(seed);
        let engine = Arc::new(SimEngine::new(engine_seed));
        let controller = TurnController::new(Arc::clone(&context), Arc::clone(&engine), config.clone());
        let events = controller.subscribe();

        Self {
            context,
            engine,
            controller,
            config,
            events,
            rng: ChaCha8Rng::seed_from_u64(schedule_seed),
            rejected: 0,
            seen: Vec::new(),
        }
    }

    /// Joins everyone and starts an 8x8 game.
    async fn start(&mut self, names: &[String], deadline_secs: u64) -> Result<Arc<WorldGrid>, ScenarioFailure> {
        for name in names {
            self.controller.join(name)?;
        }
        let config = GameConfig::new(8, 3, 4, deadline_secs)?;
        let grid = self.controller.start(config, names.iter().cloned().collect()).await?;
        Ok(grid)
    }

    /// Lets spawned tasks (deadline timers, submissions) run.
    async fn settle(&self) {
        for _ in 0..SETTLE_YIELDS {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_turn(&self, turn: u64) -> Result<(), ScenarioFailure> {
        for _ in 0..MAX_WAIT_YIELDS {
            if self.controller.current_turn() >= turn {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        Err(ScenarioFailure::Invariant(format!(
            "turn {} never opened (stuck at {})",
            turn,
            self.controller.current_turn()
        )))
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.seen.push(event),
                Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "event subscriber lagged"),
                Err(_) => break,
            }
        }
    }

    fn metrics(&self) -> ScenarioMetrics {
        let snapshot = self.controller.snapshot();
        ScenarioMetrics {
            engine_calls: self.engine.turn_calls(),
            finalized_turns: snapshot.finalized_turns,
            degraded_turns: snapshot.degraded_turns,
            rejected_submissions: self.rejected,
            events_seen: self.seen.len(),
        }
    }
}

fn player_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("p{i}")).collect()
}

/// Keeps every cell of `player` where it is.
fn stay_moves(grid: &WorldGrid, player: &str) -> Vec<CellMove> {
    grid.cells_of(player)
        .map(|c| CellMove::stay(c.x, c.y, player, c.weight))
        .collect()
}

/// Turn-scoped events never go backwards, and every turn closes once.
fn check_event_order(events: &[GameEvent]) -> Result<(), ScenarioFailure> {
    let mut last_turn = 0;
    let mut last_closed = 0;
    for event in events {
        let Some(turn) = event.turn_number() else {
            continue;
        };
        ensure(turn >= last_turn, || {
            format!("{} for turn {} published after turn {}", event.name(), turn, last_turn)
        })?;
        last_turn = turn;

        if matches!(event, GameEvent::TurnResult { .. } | GameEvent::TurnDegraded { .. }) {
            ensure(turn == last_closed + 1, || {
                format!("turn {} closed after turn {}", turn, last_closed)
            })?;
            last_closed = turn;
        }
    }
    Ok(())
}

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Rostered players per game
    num_players: usize,

    /// Turns to play where the scenario loops
    turns: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_players: usize) -> Self {
        Self {
            seed,
            num_players: num_players.max(1),
            turns: 5,
        }
    }

    /// Sets the number of turns looping scenarios play.
    pub fn with_turns(mut self, turns: u64) -> Self {
        self.turns = turns.max(1);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(runtime) => runtime.block_on(self.execute(scenario)),
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                final_turn: 0,
                final_time_secs: 0.0,
                failure_reason: Some(ScenarioFailure::Runtime(e.to_string()).to_string()),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    fn controller_config(scenario: ScenarioId) -> ControllerConfig {
        match scenario {
            ScenarioId::DeadlineRace | ScenarioId::StaleTimer => {
                ControllerConfig::default().with_early_completion(true)
            }
            _ => ControllerConfig::default(),
        }
    }

    async fn execute(&self, scenario: ScenarioId) -> ScenarioResult {
        let mut h = Harness::new(self.seed, Self::controller_config(scenario));

        let outcome = match scenario {
            ScenarioId::RosterRace => self.run_roster_race(&mut h).await,
            ScenarioId::DeadlineRace => self.run_deadline_race(&mut h).await,
            ScenarioId::UpstreamOutage => self.run_upstream_outage(&mut h).await,
            ScenarioId::LateJoiner => self.run_late_joiner(&mut h).await,
            ScenarioId::StaleTimer => self.run_stale_timer(&mut h).await,
            ScenarioId::Resubmission => self.run_resubmission(&mut h).await,
        };

        h.drain_events();
        let outcome = outcome.and_then(|()| check_event_order(&h.seen));
        let final_turn = h.controller.current_turn();
        h.controller.stop();

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            final_turn,
            final_time_secs: h.context.now().as_secs_f64(),
            failure_reason: outcome.err().map(|e| e.to_string()),
            metrics: h.metrics(),
        }
    }

    /// DST-001: every player submits from its own task in a seeded order.
    ///
    /// **Assertion**: exactly one submission per turn reports closing it and
    /// the engine sees one call per turn.
    async fn run_roster_race(&self, h: &mut Harness) -> Result<(), ScenarioFailure> {
        let names = player_names(self.num_players);
        let mut grid = h.start(&names, 0).await?;

        for turn in 1..=self.turns {
            let mut order = names.clone();
            order.shuffle(&mut h.rng);

            let mut handles = Vec::with_capacity(order.len());
            for name in order {
                let controller = h.controller.clone();
                let moves = stay_moves(&grid, &name);
                handles.push(tokio::spawn(async move {
                    controller.submit(&name, turn, moves).await
                }));
            }

            let mut closers = 0;
            for handle in handles {
                let ack = handle
                    .await
                    .map_err(|e| ScenarioFailure::Runtime(e.to_string()))??;
                if ack.finalized {
                    closers += 1;
                }
            }

            ensure(closers == 1, || format!("turn {turn} closed by {closers} submissions"))?;
            ensure(h.controller.current_turn() == turn + 1, || {
                format!("expected turn {}, controller is on {}", turn + 1, h.controller.current_turn())
            })?;
            grid = h.controller.grid();
            debug!(turn, cells = grid.cells.len(), "turn closed by roster");
        }

        let calls = h.engine.turn_calls();
        ensure(calls == self.turns, || format!("engine called {calls} times for {} turns", self.turns))
    }

    /// DST-002: the last submission and the deadline elapse in a seeded order.
    ///
    /// **Assertion**: whichever wins, each turn is computed exactly once.
    async fn run_deadline_race(&self, h: &mut Harness) -> Result<(), ScenarioFailure> {
        const DEADLINE: Duration = Duration::from_secs(2);

        let names = player_names(self.num_players);
        h.start(&names, DEADLINE.as_secs()).await?;
        let (last, early) = names
            .split_last()
            .ok_or_else(|| ScenarioFailure::Invariant("no players".into()))?;

        for turn in 1..=self.turns {
            let grid = h.controller.grid();
            for name in early {
                h.controller.submit(name, turn, stay_moves(&grid, name)).await?;
            }
            // The deadline timer must be sleeping before the clock moves.
            h.settle().await;

            let controller = h.controller.clone();
            let name = last.clone();
            let moves = stay_moves(&grid, last);
            let submit = async move { controller.submit(&name, turn, moves).await };

            let submit_first = h.rng.gen_bool(0.5);
            let handle = if submit_first {
                let handle = tokio::spawn(submit);
                h.context.advance_time(DEADLINE);
                handle
            } else {
                h.context.advance_time(DEADLINE);
                tokio::spawn(submit)
            };

            match handle.await.map_err(|e| ScenarioFailure::Runtime(e.to_string()))? {
                Ok(ack) => debug!(turn, finalized = ack.finalized, "last submission accepted"),
                Err(OrchestratorError::StaleTurn { current_turn }) => {
                    debug!(turn, current_turn, "deadline won the race");
                    h.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }

            h.wait_for_turn(turn + 1).await?;
            ensure(h.controller.current_turn() == turn + 1, || {
                format!("turn {} advanced to {}", turn, h.controller.current_turn())
            })?;
        }

        let calls = h.engine.turn_calls();
        ensure(calls == self.turns, || format!("engine called {calls} times for {} turns", self.turns))
    }

    /// DST-003: the engine fails every attempt for turn 1, then recovers.
    ///
    /// **Assertion**: turn 1 degrades with the initial grid kept, turn 2 computes.
    async fn run_upstream_outage(&self, h: &mut Harness) -> Result<(), ScenarioFailure> {
        let names = player_names(self.num_players);
        let initial = h.start(&names, 0).await?;
        let attempts = h.config.finalize_retries + 1;
        h.engine.fail_next(attempts);

        for name in &names {
            h.controller.submit(name, 1, stay_moves(&initial, name)).await?;
        }

        let snapshot = h.controller.snapshot();
        ensure(snapshot.turn == 2, || format!("outage left the game on turn {}", snapshot.turn))?;
        ensure(snapshot.degraded_turns == 1, || {
            format!("{} degraded turns after the outage", snapshot.degraded_turns)
        })?;
        ensure(*snapshot.grid == *initial, || "grid changed during the outage".into())?;
        ensure(h.engine.turn_calls() == u64::from(attempts), || {
            format!("engine saw {} attempts, expected {}", h.engine.turn_calls(), attempts)
        })?;

        for name in &names {
            h.controller.submit(name, 2, stay_moves(&initial, name)).await?;
        }
        h.drain_events();

        let degraded = h
            .seen
            .iter()
            .any(|e| matches!(e, GameEvent::TurnDegraded { turn_number: 1, .. }));
        let recovered = h
            .seen
            .iter()
            .any(|e| matches!(e, GameEvent::TurnResult { turn_number: 2, .. }));
        ensure(degraded, || "no turnDegraded event for turn 1".into())?;
        ensure(recovered, || "no turnResult event for turn 2".into())
    }

    /// DST-004: a name joins after start and tries to play.
    ///
    /// **Assertion**: it is connected but not rostered, its submission is
    /// refused, and it does not hold up the turn.
    async fn run_late_joiner(&self, h: &mut Harness) -> Result<(), ScenarioFailure> {
        let names = player_names(self.num_players);
        let grid = h.start(&names, 0).await?;
        h.controller.join("latecomer")?;

        let snapshot = h.controller.snapshot();
        ensure(snapshot.connected.iter().any(|n| n == "latecomer"), || {
            "latecomer missing from connected players".into()
        })?;
        ensure(!snapshot.roster.iter().any(|n| n == "latecomer"), || {
            "latecomer entered the running roster".into()
        })?;

        match h.controller.submit("latecomer", 1, vec![]).await {
            Err(OrchestratorError::UnknownPlayer(_)) => h.rejected += 1,
            other => {
                return Err(ScenarioFailure::Invariant(format!(
                    "late submission was not refused: {other:?}"
                )))
            }
        }

        let mut closed = false;
        for name in &names {
            closed = h.controller.submit(name, 1, stay_moves(&grid, name)).await?.finalized;
        }
        ensure(closed, || "rostered players could not close the turn".into())?;
        ensure(h.controller.current_turn() == 2, || "turn did not advance".into())
    }

    /// DST-005: turn 1 closes early; its original deadline then elapses.
    ///
    /// **Assertion**: only turn 2's own deadline closes turn 2.
    async fn run_stale_timer(&self, h: &mut Harness) -> Result<(), ScenarioFailure> {
        let names = player_names(self.num_players);
        let grid = h.start(&names, 3).await?;
        h.settle().await;

        // t=1s: everyone plays, turn 2's deadline is at t=4s
        h.context.advance_time(Duration::from_secs(1));
        h.settle().await;
        for name in &names {
            h.controller.submit(name, 1, stay_moves(&grid, name)).await?;
        }
        ensure(h.controller.current_turn() == 2, || "early completion did not close turn 1".into())?;
        h.settle().await;

        // t=3s: turn 1's deadline would have fired here
        h.context.advance_time(Duration::from_secs(2));
        h.settle().await;
        ensure(h.controller.current_turn() == 2, || "stale deadline closed turn 2".into())?;
        ensure(h.engine.turn_calls() == 1, || "stale deadline reached the engine".into())?;

        // t=4s: turn 2's own deadline
        h.context.advance_time(Duration::from_secs(1));
        h.wait_for_turn(3).await?;
        ensure(h.engine.turn_calls() == 2, || {
            format!("engine called {} times, expected 2", h.engine.turn_calls())
        })
    }

    /// DST-006: p0 submits, then changes its mind.
    ///
    /// **Assertion**: the engine only receives the second submission.
    async fn run_resubmission(&self, h: &mut Harness) -> Result<(), ScenarioFailure> {
        let names = player_names(self.num_players);
        let grid = h.start(&names, 0).await?;
        let first = &names[0];

        let original = stay_moves(&grid, first);
        // Starting cells sit off the border, so a move right stays on the grid.
        let revised: Vec<CellMove> = grid
            .cells_of(first)
            .map(|c| CellMove {
                right: c.weight,
                ..CellMove::stay(c.x, c.y, first.as_str(), 0)
            })
            .collect();

        h.controller.submit(first, 1, original).await?;
        let ack = h.controller.submit(first, 1, revised.clone()).await?;
        ensure(ack.replaced, || "second submission did not replace the first".into())?;

        for name in &names[1..] {
            h.controller.submit(name, 1, stay_moves(&grid, name)).await?;
        }

        let history = h.engine.history();
        let sent: Vec<CellMove> = history
            .last()
            .map(|moves| moves.iter().filter(|m| &m.player == first).cloned().collect())
            .unwrap_or_default();
        ensure(sent == revised, || format!("engine received {sent:?}, expected {revised:?}"))
    }
}
