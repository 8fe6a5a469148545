//! Turn Controller - the session state machine.
//!
//! Ties the [`PlayerRegistry`], [`TurnClock`] and [`MoveAggregator`] together
//! behind a single mutex and drives the simulation engine through a
//! [`SimulationGateway`].
//!
//! # Lifecycle
//!
//! ```text
//!            start/begin                 deadline | roster complete
//!   Idle ──────────────────► Open(n) ─────────────────────────────► Finalizing(n)
//!    ▲     (via Starting)      ▲                                          │
//!    │                         └──────────── open turn n+1 ◄──────────────┘
//!    └──────────── stop ─── (from any phase)
//! ```
//!
//! # Exactly-once finalization
//!
//! The deadline timer and the roster-completing submission both call the
//! same guarded transition. It checks `phase == Open && turn == n` and flips
//! the phase to `Finalizing` in one critical section; whichever trigger gets
//! there second sees `Finalizing` (or a later turn) and does nothing.
//!
//! The engine call runs outside the critical section. Submissions that
//! arrive meanwhile are rejected with `StaleTurn`.

use crate::aggregator::{MoveAggregator, MoveSubmission, PutOutcome};
use crate::broadcast::{BroadcastChannel, GameEvent};
use crate::clock::{DeadlineFiring, TurnClock};
use crate::config::{BeginParams, ControllerConfig, GameConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::{PlayerRegistry, Roster};

use cellgrid_env::{CellMove, EnvError, GameContext, InitRequest, SimulationGateway, TurnOutcome, WorldGrid};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No game running
    Idle,
    /// Waiting on the engine to create the world
    Starting,
    /// Accepting submissions for the current turn
    Open,
    /// Submissions locked, engine computing the turn
    Finalizing,
}

/// What closed a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Deadline,
    RosterComplete,
}

/// Acknowledgement for an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    /// Turn the moves were recorded for
    pub turn: u64,
    /// True if the submission replaced an earlier one from the same player
    pub replaced: bool,
    /// True if this submission completed the roster and closed the turn
    pub finalized: bool,
}

/// Read-only view of the session, safe to poll.
#[derive(Debug, Clone)]
pub struct GameSnapshot {
    pub phase: Phase,
    pub turn: u64,
    pub grid: Arc<WorldGrid>,
    pub config: Option<GameConfig>,
    /// Frozen roster of the running (or last) game
    pub roster: Vec<String>,
    /// Everyone who has joined, in join order
    pub connected: Vec<String>,
    /// Roster members that have submitted for the open turn
    pub submitted: Vec<String>,
    /// Time left before the open turn's deadline
    pub deadline_remaining: Option<Duration>,
    pub finalized_turns: u64,
    pub degraded_turns: u64,
}

// =============================================================================
// SESSION STATE
// =============================================================================

/// Everything guarded by the controller mutex.
#[derive(Debug)]
struct Session {
    phase: Phase,
    /// Bumped by every start and stop; stale async work compares against it
    epoch: u64,
    turn: u64,
    config: Option<GameConfig>,
    roster: Roster,
    registry: PlayerRegistry,
    aggregator: MoveAggregator,
    clock: TurnClock,
    grid: Arc<WorldGrid>,
    finalized_turns: u64,
    degraded_turns: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            epoch: 0,
            turn: 0,
            config: None,
            roster: Roster::default(),
            registry: PlayerRegistry::new(),
            aggregator: MoveAggregator::new(),
            clock: TurnClock::new(),
            grid: Arc::new(WorldGrid::default()),
            finalized_turns: 0,
            degraded_turns: 0,
        }
    }
}

/// Work captured when a turn enters `Finalizing`.
#[derive(Debug)]
struct FinalizeJob {
    epoch: u64,
    turn: u64,
    trigger: Trigger,
    config: GameConfig,
    moves: Vec<CellMove>,
}

struct Shared<Ctx, Gw> {
    context: Arc<Ctx>,
    gateway: Arc<Gw>,
    config: ControllerConfig,
    events: BroadcastChannel,
    session: Mutex<Session>,
}

// =============================================================================
// TURN CONTROLLER
// =============================================================================

/// The turn orchestration engine.
///
/// Generic over the context and gateway implementations, so the same
/// controller runs against tokio + HTTP in production and a virtual clock +
/// in-process engine in simulation. Cloning yields another handle to the
/// same session.
pub struct TurnController<Ctx, Gw>
where
    Ctx: GameContext,
    Gw: SimulationGateway,
{
    shared: Arc<Shared<Ctx, Gw>>,
}

impl<Ctx, Gw> Clone for TurnController<Ctx, Gw>
where
    Ctx: GameContext,
    Gw: SimulationGateway,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Ctx, Gw> TurnController<Ctx, Gw>
where
    Ctx: GameContext,
    Gw: SimulationGateway,
{
    /// Creates an idle controller.
    pub fn new(context: Arc<Ctx>, gateway: Arc<Gw>, config: ControllerConfig) -> Self {
        let events = BroadcastChannel::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                context,
                gateway,
                config,
                events,
                session: Mutex::new(Session::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        // Session invariants are re-established before every unlock, so a
        // poisoned guard is still consistent.
        self.shared
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to game events.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.shared.events.subscribe()
    }

    /// The event channel.
    pub fn events(&self) -> &BroadcastChannel {
        &self.shared.events
    }

    /// The environment context.
    pub fn context(&self) -> &Arc<Ctx> {
        &self.shared.context
    }

    // -------------------------------------------------------------------------
    // Players
    // -------------------------------------------------------------------------

    /// Registers a player and broadcasts the updated list.
    pub fn join(&self, name: &str) -> OrchestratorResult<Vec<String>> {
        let mut guard = self.lock();
        let s = &mut *guard;

        let now = self.shared.context.now();
        if s.registry.join(name, now)? {
            info!(player = %name, connected = s.registry.len(), "player joined");
        }
        let players = s.registry.names();
        self.shared.events.publish(GameEvent::PlayerJoined {
            players: players.clone(),
        });
        Ok(players)
    }

    /// Connected player names in join order.
    pub fn players(&self) -> Vec<String> {
        self.lock().registry.names()
    }

    // -------------------------------------------------------------------------
    // Read-only state
    // -------------------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Number of the open (or finalizing) turn; 0 before the first game.
    pub fn current_turn(&self) -> u64 {
        self.lock().turn
    }

    /// Latest world grid.
    pub fn grid(&self) -> Arc<WorldGrid> {
        Arc::clone(&self.lock().grid)
    }

    /// Consistent snapshot of the whole session.
    pub fn snapshot(&self) -> GameSnapshot {
        let s = self.lock();
        let now = self.shared.context.now();
        GameSnapshot {
            phase: s.phase,
            turn: s.turn,
            grid: Arc::clone(&s.grid),
            config: s.config.clone(),
            roster: s.roster.names().to_vec(),
            connected: s.registry.names(),
            submitted: s.aggregator.submitted(),
            deadline_remaining: s.clock.deadline_at().map(|at| at.saturating_sub(now)),
            finalized_turns: s.finalized_turns,
            degraded_turns: s.degraded_turns,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Starts a game from raw request parameters with everyone connected so far.
    pub async fn begin(&self, params: BeginParams) -> OrchestratorResult<Arc<WorldGrid>> {
        let config = params.into_config()?;
        let roster = self.lock().registry.roster();
        self.start(config, roster).await
    }

    /// Starts a game. Valid only while idle.
    ///
    /// Asks the engine for the initial world, then opens turn 1. If the
    /// engine fails the controller stays idle.
    pub async fn start(&self, config: GameConfig, roster: Roster) -> OrchestratorResult<Arc<WorldGrid>> {
        config.validate()?;
        if roster.is_empty() {
            return Err(OrchestratorError::validation("no players have joined"));
        }

        let epoch = {
            let mut s = self.lock();
            if s.phase != Phase::Idle {
                return Err(OrchestratorError::AlreadyRunning);
            }
            s.phase = Phase::Starting;
            s.epoch += 1;
            s.epoch
        };

        let request = InitRequest {
            grid_size: config.grid_size,
            number_of_vitamins: config.vitamins_count,
            players: roster.names().to_vec(),
            start_weight: config.start_weight,
        };
        let result = self.shared.gateway.initialize(&request).await;

        let mut guard = self.lock();
        let s = &mut *guard;
        if s.epoch != epoch || s.phase != Phase::Starting {
            // stop() ran while the engine was initializing
            return Err(OrchestratorError::NotRunning);
        }

        match result {
            Ok(grid) => {
                let grid = Arc::new(grid);
                info!(
                    grid_size = config.grid_size,
                    vitamins = config.vitamins_count,
                    start_weight = config.start_weight,
                    deadline_secs = config.turn_deadline_secs,
                    players = ?roster.names(),
                    seed = self.shared.context.seed(),
                    "game started"
                );
                s.grid = Arc::clone(&grid);
                s.config = Some(config);
                s.roster = roster;
                s.turn = 0;
                s.finalized_turns = 0;
                s.degraded_turns = 0;
                self.open_next_turn(s);
                Ok(grid)
            }
            Err(e) => {
                s.phase = Phase::Idle;
                error!(error = %e, "engine failed to initialize the game");
                Err(OrchestratorError::Upstream(e))
            }
        }
    }

    /// Stops the running game and returns to idle.
    ///
    /// Returns false if nothing was running. A finalization in flight
    /// discards its result.
    pub fn stop(&self) -> bool {
        let mut s = self.lock();
        if s.phase == Phase::Idle {
            return false;
        }
        s.clock.cancel();
        s.aggregator.close();
        s.phase = Phase::Idle;
        s.epoch += 1;
        info!(turn = s.turn, "game stopped");
        true
    }

    // -------------------------------------------------------------------------
    // Submissions
    // -------------------------------------------------------------------------

    /// Records `player`'s moves for `turn`.
    ///
    /// When the game has no deadline (or early completion is enabled) and
    /// this submission completes the roster, the turn is finalized before
    /// returning.
    pub async fn submit(
        &self,
        player: &str,
        turn: u64,
        moves: Vec<CellMove>,
    ) -> OrchestratorResult<SubmitAck> {
        let (outcome, job) = {
            let mut guard = self.lock();
            let s = &mut *guard;

            match s.phase {
                Phase::Idle | Phase::Starting => return Err(OrchestratorError::NotRunning),
                Phase::Finalizing => {
                    debug!(player, turn, current = s.turn, "submission during finalization");
                    return Err(OrchestratorError::StaleTurn { current_turn: s.turn });
                }
                Phase::Open => {}
            }
            if turn != s.turn {
                warn!(player, turn, current = s.turn, "stale submission rejected");
                return Err(OrchestratorError::StaleTurn { current_turn: s.turn });
            }
            if !s.roster.contains(player) {
                return Err(OrchestratorError::UnknownPlayer(player.to_string()));
            }
            check_moves(&s.grid, player, &moves)?;

            let count = moves.len();
            let outcome = s.aggregator.put(MoveSubmission {
                player: player.to_string(),
                turn,
                moves,
            })?;
            debug!(player, turn, moves = count, ?outcome, "moves recorded");

            let may_complete = s
                .config
                .as_ref()
                .map(|c| c.turn_deadline_secs == 0 || self.shared.config.early_completion)
                .unwrap_or(false);

            let job = if may_complete && s.aggregator.is_complete(&s.roster) {
                info!(turn, "all players have played");
                self.begin_finalize(s, turn, Trigger::RosterComplete)
            } else {
                None
            };
            (outcome, job)
        };

        let finalized = job.is_some();
        if let Some(job) = job {
            self.finalize(job).await;
        }

        Ok(SubmitAck {
            turn,
            replaced: outcome == PutOutcome::Replaced,
            finalized,
        })
    }

    // -------------------------------------------------------------------------
    // Deadline trigger
    // -------------------------------------------------------------------------

    /// Closes `turn` as if its deadline elapsed.
    ///
    /// Returns true if this call finalized the turn, false if the turn was
    /// already closed (or never open).
    pub async fn expire_turn(&self, turn: u64) -> bool {
        let job = {
            let mut guard = self.lock();
            self.begin_finalize(&mut guard, turn, Trigger::Deadline)
        };
        match job {
            Some(job) => {
                self.finalize(job).await;
                true
            }
            None => false,
        }
    }

    async fn on_deadline(&self, firing: DeadlineFiring) {
        let job = {
            let mut guard = self.lock();
            let s = &mut *guard;
            if !s.clock.is_current(&firing) {
                warn!(turn = firing.turn, current = s.turn, "late deadline ignored");
                return;
            }
            info!(turn = firing.turn, "deadline reached");
            self.begin_finalize(s, firing.turn, Trigger::Deadline)
        };
        if let Some(job) = job {
            self.finalize(job).await;
        }
    }

    // -------------------------------------------------------------------------
    // Transitions (callers hold the session lock)
    // -------------------------------------------------------------------------

    /// The guarded `Open(turn) -> Finalizing(turn)` transition.
    fn begin_finalize(&self, s: &mut Session, turn: u64, trigger: Trigger) -> Option<FinalizeJob> {
        if s.phase != Phase::Open || s.turn != turn {
            debug!(turn, current = s.turn, phase = ?s.phase, ?trigger, "turn already closed");
            return None;
        }
        let config = s.config.clone()?;

        s.phase = Phase::Finalizing;
        s.clock.cancel();
        // Roster order first, anyone else after in arrival order.
        let mut drained = s.aggregator.drain_and_reset();
        drained.sort_by_key(|sub| s.roster.position(&sub.player).unwrap_or(usize::MAX));
        let moves: Vec<CellMove> = drained.into_iter().flat_map(|sub| sub.moves).collect();

        Some(FinalizeJob {
            epoch: s.epoch,
            turn,
            trigger,
            config,
            moves,
        })
    }

    /// Opens `turn + 1`, arms its deadline and announces it.
    fn open_next_turn(&self, s: &mut Session) {
        let Some(config) = s.config.clone() else {
            return;
        };

        s.turn += 1;
        s.phase = Phase::Open;
        s.aggregator.open(s.turn);

        let weak: Weak<Shared<Ctx, Gw>> = Arc::downgrade(&self.shared);
        s.clock.arm(
            &self.shared.context,
            s.turn,
            config.turn_deadline_secs,
            move |firing| async move {
                if let Some(shared) = weak.upgrade() {
                    TurnController { shared }.on_deadline(firing).await;
                }
            },
        );

        info!(turn = s.turn, deadline_secs = config.turn_deadline_secs, "turn opened");
        self.shared.events.publish(GameEvent::TurnOpened {
            turn_number: s.turn,
            config,
            current_grid: (*s.grid).clone(),
        });
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    async fn compute_with_retry(&self, job: &FinalizeJob) -> (Result<TurnOutcome, EnvError>, u32) {
        let max_attempts = self.shared.config.finalize_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.gateway.compute_turn(&job.moves).await {
                Ok(outcome) => return (Ok(outcome), attempt),
                Err(e) if attempt < max_attempts => {
                    warn!(turn = job.turn, attempt, error = %e, "engine call failed, retrying");
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    async fn finalize(&self, job: FinalizeJob) {
        info!(
            turn = job.turn,
            trigger = ?job.trigger,
            moves = job.moves.len(),
            "finalizing turn"
        );

        let (result, attempts) = self.compute_with_retry(&job).await;

        let mut guard = self.lock();
        let s = &mut *guard;
        if s.epoch != job.epoch || s.phase != Phase::Finalizing || s.turn != job.turn {
            info!(turn = job.turn, "session changed during finalization, result discarded");
            return;
        }

        match result {
            Ok(outcome) => {
                s.grid = Arc::new(WorldGrid::new(job.config.grid_size, outcome.cells));
                info!(turn = job.turn, cells = s.grid.cells.len(), "turn computed");
                self.shared.events.publish(GameEvent::TurnResult {
                    turn_number: job.turn,
                    animation_trace: outcome.animation,
                    config: job.config,
                });
            }
            Err(e) => {
                s.degraded_turns += 1;
                error!(turn = job.turn, attempts, error = %e, "engine failed, keeping previous grid");
                self.shared.events.publish(GameEvent::TurnDegraded {
                    turn_number: job.turn,
                    attempts,
                    reason: e.to_string(),
                });
            }
        }

        s.finalized_turns += 1;
        self.open_next_turn(s);
    }
}

/// Every move must split one of `player`'s cells in `grid` exactly once,
/// with counts summing to the cell's weight.
fn check_moves(grid: &WorldGrid, player: &str, moves: &[CellMove]) -> OrchestratorResult<()> {
    let mut seen: Vec<(i32, i32)> = Vec::with_capacity(moves.len());
    for mv in moves {
        if mv.player != player {
            return Err(OrchestratorError::validation(format!(
                "move at ({}, {}) belongs to '{}', not '{}'",
                mv.x, mv.y, mv.player, player
            )));
        }
        let cell = grid
            .cells_of(player)
            .find(|c| c.x == mv.x && c.y == mv.y)
            .ok_or_else(|| {
                OrchestratorError::validation(format!("'{}' has no cell at ({}, {})", player, mv.x, mv.y))
            })?;
        if mv.total_weight() != u64::from(cell.weight) {
            return Err(OrchestratorError::validation(format!(
                "move at ({}, {}) splits {} but the cell weighs {}",
                mv.x,
                mv.y,
                mv.total_weight(),
                cell.weight
            )));
        }
        if seen.contains(&(mv.x, mv.y)) {
            return Err(OrchestratorError::validation(format!(
                "cell ({}, {}) moved twice",
                mv.x, mv.y
            )));
        }
        seen.push((mv.x, mv.y));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cellgrid_env::{Cell, TokioContext};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Gateway double: echoes a fixed grid, counts calls, fails on demand.
    #[derive(Default)]
    struct ScriptedGateway {
        init_calls: AtomicU32,
        turn_calls: AtomicU32,
        fail_init: bool,
        fail_turns: AtomicU32,
        last_moves: Mutex<Vec<CellMove>>,
    }

    impl ScriptedGateway {
        fn failing_turns(n: u32) -> Self {
            Self {
                fail_turns: AtomicU32::new(n),
                ..Default::default()
            }
        }

        fn turn_calls(&self) -> u32 {
            self.turn_calls.load(Ordering::SeqCst)
        }
    }

    fn cell(player: &str, weight: u32) -> Cell {
        Cell { x: 1, y: 1, weight, player: player.to_string() }
    }

    #[async_trait]
    impl SimulationGateway for ScriptedGateway {
        async fn initialize(&self, request: &InitRequest) -> Result<WorldGrid, EnvError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(EnvError::unreachable("engine down"));
            }
            let cells = request.players.iter().map(|p| cell(p, request.start_weight)).collect();
            Ok(WorldGrid::new(request.grid_size, cells))
        }

        async fn compute_turn(&self, moves: &[CellMove]) -> Result<TurnOutcome, EnvError> {
            let call = self.turn_calls.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_moves.lock().unwrap() = moves.to_vec();
            let remaining = self.fail_turns.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_turns.store(remaining - 1, Ordering::SeqCst);
                return Err(EnvError::Timeout(100));
            }
            Ok(TurnOutcome {
                animation: serde_json::json!([{ "call": call }]),
                cells: vec![cell("p1", 100 + call)],
            })
        }
    }

    type TestController = TurnController<TokioContext, ScriptedGateway>;

    fn controller_with(gateway: ScriptedGateway, config: ControllerConfig) -> (TestController, Arc<ScriptedGateway>) {
        let gateway = Arc::new(gateway);
        let controller = TurnController::new(TokioContext::shared(), Arc::clone(&gateway), config);
        (controller, gateway)
    }

    fn controller() -> (TestController, Arc<ScriptedGateway>) {
        controller_with(ScriptedGateway::default(), ControllerConfig::default())
    }

    fn roster(names: &[&str]) -> Roster {
        names.iter().copied().collect()
    }

    fn config(deadline: u64) -> GameConfig {
        GameConfig::new(10, 3, 4, deadline).unwrap()
    }

    fn moves_for(player: &str) -> Vec<CellMove> {
        vec![CellMove::stay(1, 1, player, 4)]
    }

    #[tokio::test]
    async fn test_round_trip_two_players() {
        let (ctl, gateway) = controller();
        ctl.join("p1").unwrap();
        ctl.join("p2").unwrap();

        let params: BeginParams = serde_json::from_value(serde_json::json!({
            "grid_size": 10, "number_of_vitamins": 3, "start_weight": 4, "time_between_moves": 0
        }))
        .unwrap();
        let grid = ctl.begin(params).await.unwrap();
        assert_eq!(grid.size, 10);
        assert_eq!(ctl.current_turn(), 1);
        assert_eq!(ctl.phase(), Phase::Open);

        let ack = ctl.submit("p1", 1, moves_for("p1")).await.unwrap();
        assert!(!ack.finalized);
        assert_eq!(ctl.current_turn(), 1);

        let ack = ctl.submit("p2", 1, moves_for("p2")).await.unwrap();
        assert!(ack.finalized);

        let snap = ctl.snapshot();
        assert_eq!(snap.turn, 2);
        assert_eq!(snap.grid.cells, vec![cell("p1", 101)]);
        assert_eq!(snap.finalized_turns, 1);
        assert_eq!(gateway.turn_calls(), 1);
        assert_eq!(gateway.last_moves.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_turn_reports_current() {
        let (ctl, _) = controller();
        ctl.start(config(0), roster(&["A", "B"])).await.unwrap();

        let err = ctl.submit("A", 5, moves_for("A")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StaleTurn { current_turn: 1 }));
        assert!(ctl.snapshot().submitted.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_submissions() {
        let (ctl, _) = controller();
        ctl.start(config(0), roster(&["A"])).await.unwrap();

        let err = ctl.submit("Z", 1, moves_for("Z")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPlayer(ref p) if p == "Z"));

        let err = ctl.submit("A", 1, moves_for("B")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_submit_before_start() {
        let (ctl, _) = controller();
        let err = ctl.submit("A", 1, vec![]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotRunning));
    }

    #[tokio::test]
    async fn test_resubmission_overwrites() {
        let (ctl, gateway) = controller();
        ctl.start(config(0), roster(&["A", "B"])).await.unwrap();

        let revised = CellMove {
            right: 4,
            ..CellMove::stay(1, 1, "A", 0)
        };
        ctl.submit("A", 1, moves_for("A")).await.unwrap();
        let ack = ctl.submit("A", 1, vec![revised.clone()]).await.unwrap();
        assert!(ack.replaced);
        ctl.submit("B", 1, vec![]).await.unwrap();

        let sent = gateway.last_moves.lock().unwrap().clone();
        assert_eq!(sent, vec![revised]);
    }

    #[tokio::test]
    async fn test_moves_sent_in_roster_order() {
        let (ctl, gateway) = controller();
        ctl.start(config(0), roster(&["A", "B"])).await.unwrap();

        ctl.submit("B", 1, moves_for("B")).await.unwrap();
        ctl.submit("A", 1, moves_for("A")).await.unwrap();

        let owners: Vec<String> = gateway.last_moves.lock().unwrap().iter().map(|m| m.player.clone()).collect();
        assert_eq!(owners, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (ctl, _) = controller();
        ctl.start(config(0), roster(&["A"])).await.unwrap();
        let err = ctl.start(config(0), roster(&["A"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_idle() {
        let gateway = ScriptedGateway {
            fail_init: true,
            ..Default::default()
        };
        let (ctl, _) = controller_with(gateway, ControllerConfig::default());

        let err = ctl.start(config(0), roster(&["A"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Upstream(_)));
        assert_eq!(ctl.phase(), Phase::Idle);
        assert_eq!(ctl.current_turn(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_never_reaches_engine() {
        let (ctl, gateway) = controller();
        let bad = GameConfig {
            grid_size: 0,
            ..GameConfig::default()
        };
        let err = ctl.start(bad, roster(&["A"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(gateway.init_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (ctl, gateway) = controller_with(ScriptedGateway::failing_turns(1), ControllerConfig::default());
        let mut rx = ctl.subscribe();
        ctl.start(config(0), roster(&["A"])).await.unwrap();
        ctl.submit("A", 1, vec![]).await.unwrap();

        assert_eq!(gateway.turn_calls(), 2);
        let snap = ctl.snapshot();
        assert_eq!(snap.turn, 2);
        assert_eq!(snap.degraded_turns, 0);

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["turnOpened", "turnResult", "turnOpened"]);
    }

    #[tokio::test]
    async fn test_fail_open_keeps_grid_and_reports() {
        let (ctl, gateway) = controller_with(ScriptedGateway::failing_turns(5), ControllerConfig::default());
        let mut rx = ctl.subscribe();
        let initial = ctl.start(config(0), roster(&["A"])).await.unwrap();
        ctl.submit("A", 1, vec![]).await.unwrap();

        assert_eq!(gateway.turn_calls(), 2);
        let snap = ctl.snapshot();
        assert_eq!(snap.turn, 2);
        assert_eq!(snap.degraded_turns, 1);
        assert_eq!(*snap.grid, *initial);

        let degraded = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|e| e.name() == "turnDegraded")
            .unwrap();
        assert!(matches!(degraded, GameEvent::TurnDegraded { turn_number: 1, attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_late_joiner_does_not_gate_turn() {
        let (ctl, _) = controller();
        ctl.join("A").unwrap();
        ctl.begin(BeginParams::default()).await.unwrap();
        ctl.join("B").unwrap();

        let ack = ctl.submit("A", 1, vec![]).await.unwrap();
        assert!(ack.finalized);
        assert_eq!(ctl.snapshot().roster, vec!["A"]);
        assert_eq!(ctl.players(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_closes_turn_without_submissions() {
        let (ctl, gateway) = controller();
        let mut rx = ctl.subscribe();
        ctl.start(config(3), roster(&["A", "B"])).await.unwrap();
        assert!(ctl.snapshot().deadline_remaining.is_some());

        // Everyone submitting does not close a turn that has a deadline.
        ctl.submit("A", 1, vec![]).await.unwrap();
        let ack = ctl.submit("B", 1, vec![]).await.unwrap();
        assert!(!ack.finalized);

        loop {
            if let GameEvent::TurnResult { turn_number, .. } = rx.recv().await.unwrap() {
                assert_eq!(turn_number, 1);
                break;
            }
        }
        assert_eq!(gateway.turn_calls(), 1);
        assert_eq!(ctl.current_turn(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_completion_cancels_deadline() {
        let config_early = ControllerConfig::default().with_early_completion(true);
        let (ctl, gateway) = controller_with(ScriptedGateway::default(), config_early);
        ctl.start(config(5), roster(&["A"])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let ack = ctl.submit("A", 1, vec![]).await.unwrap();
        assert!(ack.finalized);
        assert_eq!(ctl.current_turn(), 2);

        // Past turn 1's deadline but short of turn 2's: nothing else fires.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(ctl.current_turn(), 2);
        assert_eq!(gateway.turn_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_expiry_is_noop() {
        let (ctl, gateway) = controller();
        ctl.start(config(0), roster(&["A"])).await.unwrap();
        ctl.submit("A", 1, vec![]).await.unwrap();
        assert_eq!(ctl.current_turn(), 2);

        assert!(!ctl.expire_turn(1).await);
        assert_eq!(ctl.current_turn(), 2);
        assert_eq!(gateway.turn_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_returns_to_idle() {
        let (ctl, _) = controller();
        ctl.start(config(0), roster(&["A"])).await.unwrap();
        assert!(ctl.stop());
        assert!(!ctl.stop());
        assert_eq!(ctl.phase(), Phase::Idle);
        assert!(matches!(
            ctl.submit("A", 1, vec![]).await.unwrap_err(),
            OrchestratorError::NotRunning
        ));

        // A new game starts again from turn 1.
        ctl.start(config(0), roster(&["A"])).await.unwrap();
        assert_eq!(ctl.current_turn(), 1);
    }

    #[tokio::test]
    async fn test_begin_without_players_is_rejected() {
        let (ctl, gateway) = controller();
        let err = ctl.begin(BeginParams::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(ctl.phase(), Phase::Idle);
        assert_eq!(gateway.init_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_deadline_still_opens_turn() {
        let (ctl, _) = controller();
        ctl.join("A").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let params: BeginParams =
            serde_json::from_value(serde_json::json!({ "time_between_moves": 1e30 })).unwrap();
        ctl.begin(params).await.unwrap();

        let snap = ctl.snapshot();
        assert_eq!(snap.phase, Phase::Open);
        assert_eq!(snap.turn, 1);
        assert_eq!(
            snap.config.map(|c| c.turn_deadline_secs),
            Some(crate::config::MAX_TURN_DEADLINE_SECS)
        );
        assert!(snap.deadline_remaining.is_some());
    }

    #[tokio::test]
    async fn test_moves_must_split_own_cells() {
        let (ctl, _) = controller();
        ctl.start(config(0), roster(&["A", "B"])).await.unwrap();

        for bad in [
            vec![CellMove::stay(1, 1, "A", 3)],
            vec![CellMove::stay(5, 5, "A", 4)],
            vec![CellMove::stay(1, 1, "A", 4), CellMove::stay(1, 1, "A", 4)],
        ] {
            let err = ctl.submit("A", 1, bad).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Validation(_)));
        }
        assert!(ctl.snapshot().submitted.is_empty());

        let split = CellMove {
            up: 1,
            down: 1,
            left: 1,
            right: 1,
            ..CellMove::stay(1, 1, "A", 0)
        };
        assert!(ctl.submit("A", 1, vec![split]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_deadline_races_final_submission() {
        let early = ControllerConfig::default().with_early_completion(true);
        let (ctl, gateway) = controller_with(ScriptedGateway::default(), early);
        let (mut by_submit, mut by_deadline) = (0, 0);

        for trial in 0..30u64 {
            let calls_before = gateway.turn_calls();
            ctl.start(config(1), roster(&["A", "B"])).await.unwrap();
            ctl.submit("A", 1, moves_for("A")).await.unwrap();

            // The last submission lands just before, on, or just after the deadline.
            let offset = Duration::from_millis(999 + trial % 3);
            let yields = (trial / 3) % 3;
            let last = {
                let ctl = ctl.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(offset).await;
                    for _ in 0..yields {
                        tokio::task::yield_now().await;
                    }
                    ctl.submit("B", 1, moves_for("B")).await
                })
            };

            match last.await.unwrap() {
                Ok(ack) => {
                    assert!(ack.finalized);
                    by_submit += 1;
                }
                Err(OrchestratorError::StaleTurn { .. }) => by_deadline += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }

            for _ in 0..1000 {
                if ctl.current_turn() == 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(ctl.current_turn(), 2);
            assert_eq!(gateway.turn_calls() - calls_before, 1);
            assert!(ctl.stop());
        }

        assert!(by_submit > 0, "the submission never beat the deadline");
        assert!(by_deadline > 0, "the deadline never beat the submission");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deadline_and_roster_race_finalize_once() {
        for _ in 0..200 {
            let (ctl, gateway) = controller();
            ctl.start(config(0), roster(&["A", "B"])).await.unwrap();
            ctl.submit("A", 1, vec![]).await.unwrap();

            let by_deadline = {
                let ctl = ctl.clone();
                tokio::spawn(async move { ctl.expire_turn(1).await })
            };
            let by_roster = {
                let ctl = ctl.clone();
                tokio::spawn(async move { ctl.submit("B", 1, vec![]).await })
            };

            let deadline_won = by_deadline.await.unwrap();
            let roster_won = match by_roster.await.unwrap() {
                Ok(ack) => ack.finalized,
                Err(OrchestratorError::StaleTurn { .. }) => false,
                Err(e) => panic!("unexpected error: {e}"),
            };

            assert!(deadline_won ^ roster_won, "exactly one trigger must win");
            assert_eq!(ctl.current_turn(), 2);
            assert_eq!(gateway.turn_calls(), 1);
        }
    }
}
