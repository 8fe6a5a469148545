//! In-process simulation engine with fault injection.
//!
//! Implements the same world rules as the external engine service so the
//! turn controller can be exercised end to end without a network:
//! - initial players on a ring around the centre, vitamins on free cells
//! - validated weight splits, head-on swaps resolved mid-way
//! - arrivals merged per destination, heaviest owner wins (seeded tie-break)
//! - vitamins replenished back to the configured count after each turn

use crate::context::SimContext;

use async_trait::async_trait;
use cellgrid_env::{
    Cell, CellMove, Direction, EnvError, GameContext, InitRequest, SimulationGateway, TurnOutcome,
    WorldGrid, VITAMIN_OWNER,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Fate of one sub-cell in the animation trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Survives,
    DiesMidway,
    DiesArrival,
}

/// One sub-cell movement, as the engine service reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnimationStep {
    pub origin_x: i32,
    pub origin_y: i32,
    pub weight: u32,
    pub direction: Direction,
    pub player: String,
    pub result: StepResult,
}

/// A piece of weight travelling from `origin` to `dest` this turn.
#[derive(Debug, Clone)]
struct Fragment {
    origin: (i32, i32),
    dest: (i32, i32),
    player: String,
    weight: u32,
    /// Animation steps carried by this fragment
    steps: Vec<usize>,
}

#[derive(Debug, Clone)]
struct EngineWorld {
    size: u32,
    vitamins: u32,
    cells: Vec<Cell>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_inits: u32,
    fail_turns: u32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic in-process engine.
pub struct SimEngine {
    rng: Mutex<ChaCha8Rng>,
    world: Mutex<Option<EngineWorld>>,
    faults: Mutex<FaultPlan>,
    latency: Option<(Arc<SimContext>, Duration)>,
    init_calls: AtomicU32,
    turn_calls: AtomicU64,
    history: Mutex<Vec<Vec<CellMove>>>,
}

impl SimEngine {
    /// Creates an engine whose random choices derive from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            world: Mutex::new(None),
            faults: Mutex::new(FaultPlan::default()),
            latency: None,
            init_calls: AtomicU32::new(0),
            turn_calls: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Delays every call by `latency` of virtual time on `context`.
    pub fn with_latency(mut self, context: Arc<SimContext>, latency: Duration) -> Self {
        self.latency = Some((context, latency));
        self
    }

    /// Makes the next `n` turn computations fail as unreachable.
    pub fn fail_next(&self, n: u32) {
        lock(&self.faults).fail_turns = n;
    }

    /// Makes the next `n` initializations fail as unreachable.
    pub fn fail_next_init(&self, n: u32) {
        lock(&self.faults).fail_inits = n;
    }

    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of `compute_turn` calls, failed ones included.
    pub fn turn_calls(&self) -> u64 {
        self.turn_calls.load(Ordering::SeqCst)
    }

    /// Moves received by each `compute_turn` call, in call order.
    pub fn history(&self) -> Vec<Vec<CellMove>> {
        lock(&self.history).clone()
    }

    /// The engine's current world, if initialized.
    pub fn world(&self) -> Option<WorldGrid> {
        lock(&self.world)
            .as_ref()
            .map(|w| WorldGrid::new(w.size, w.cells.clone()))
    }

    async fn delay(&self) {
        if let Some((ctx, latency)) = &self.latency {
            ctx.sleep(*latency).await;
        }
    }

    fn take_fault(&self, init: bool) -> bool {
        let mut faults = lock(&self.faults);
        let counter = if init {
            &mut faults.fail_inits
        } else {
            &mut faults.fail_turns
        };
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl SimulationGateway for SimEngine {
    async fn initialize(&self, request: &InitRequest) -> Result<WorldGrid, EnvError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.take_fault(true) {
            warn!("injected init failure");
            return Err(EnvError::unreachable("injected engine failure"));
        }
        if request.grid_size == 0 {
            return Err(EnvError::Status {
                status: 422,
                body: "grid_size must be positive".into(),
            });
        }

        let cells = {
            let mut rng = lock(&self.rng);
            initial_cells(request, &mut rng)
        };
        debug!(players = request.players.len(), cells = cells.len(), "engine world created");

        *lock(&self.world) = Some(EngineWorld {
            size: request.grid_size,
            vitamins: request.number_of_vitamins,
            cells: cells.clone(),
        });
        Ok(WorldGrid::new(request.grid_size, cells))
    }

    async fn compute_turn(&self, moves: &[CellMove]) -> Result<TurnOutcome, EnvError> {
        self.turn_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.history).push(moves.to_vec());
        self.delay().await;
        if self.take_fault(false) {
            warn!("injected turn failure");
            return Err(EnvError::unreachable("injected engine failure"));
        }

        let mut world_guard = lock(&self.world);
        let world = world_guard.as_mut().ok_or_else(|| EnvError::Status {
            status: 409,
            body: "no game initialized".into(),
        })?;

        let (steps, cells) = {
            let mut rng = lock(&self.rng);
            resolve_turn(world, moves, &mut rng)
        };
        world.cells = cells.clone();

        let animation = serde_json::to_value(&steps).map_err(EnvError::malformed)?;
        Ok(TurnOutcome { animation, cells })
    }
}

// =============================================================================
// WORLD RULES
// =============================================================================

/// Players on a ring around the centre, then `number_of_vitamins` weight-1
/// vitamins on random free cells.
fn initial_cells(request: &InitRequest, rng: &mut ChaCha8Rng) -> Vec<Cell> {
    let n = request.grid_size as i32;
    let centre = f64::from(n - 1) / 2.0;
    let radius = (f64::from(n - 1) / 2.0 - 1.0).max(1.0);
    let (lo, hi) = if n >= 3 { (1, n - 2) } else { (0, n - 1) };

    let count = request.players.len();
    let mut cells: Vec<Cell> = request
        .players
        .iter()
        .enumerate()
        .map(|(i, player)| {
            let angle = 2.0 * std::f64::consts::PI * i as f64 / count as f64;
            let x = (centre + radius * angle.cos()).round() as i32;
            let y = (centre + radius * angle.sin()).round() as i32;
            Cell {
                x: x.clamp(lo, hi),
                y: y.clamp(lo, hi),
                weight: request.start_weight,
                player: player.clone(),
            }
        })
        .collect();

    place_vitamins(&mut cells, request.grid_size, request.number_of_vitamins as usize, rng);
    cells
}

fn place_vitamins(cells: &mut Vec<Cell>, size: u32, count: usize, rng: &mut ChaCha8Rng) {
    if count == 0 {
        return;
    }
    let n = size as i32;
    let mut free: Vec<(i32, i32)> = (0..n)
        .flat_map(|x| (0..n).map(move |y| (x, y)))
        .filter(|&(x, y)| !cells.iter().any(|c| c.x == x && c.y == y))
        .collect();
    free.shuffle(rng);

    cells.extend(free.into_iter().take(count).map(|(x, y)| Cell {
        x,
        y,
        weight: 1,
        player: VITAMIN_OWNER.to_string(),
    }));
}

fn resolve_turn(
    world: &EngineWorld,
    moves: &[CellMove],
    rng: &mut ChaCha8Rng,
) -> (Vec<AnimationStep>, Vec<Cell>) {
    let n = world.size as i32;
    let in_bounds = |(x, y): (i32, i32)| x >= 0 && y >= 0 && x < n && y < n;

    // Same owner on the same square counts as one cell.
    let mut remaining: BTreeMap<(i32, i32, String), u32> = BTreeMap::new();
    for cell in &world.cells {
        *remaining.entry((cell.x, cell.y, cell.player.clone())).or_default() += cell.weight;
    }

    let mut steps: Vec<AnimationStep> = Vec::new();
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut push = |steps: &mut Vec<AnimationStep>,
                    origin: (i32, i32),
                    direction: Direction,
                    player: &str,
                    weight: u32| {
        let (dx, dy) = direction.offset();
        steps.push(AnimationStep {
            origin_x: origin.0,
            origin_y: origin.1,
            weight,
            direction,
            player: player.to_string(),
            result: StepResult::Survives,
        });
        fragments.push(Fragment {
            origin,
            dest: (origin.0 + dx, origin.1 + dy),
            player: player.to_string(),
            weight,
            steps: vec![steps.len() - 1],
        });
    };

    for mv in moves {
        let key = (mv.x, mv.y, mv.player.clone());
        let Some(&weight) = remaining.get(&key) else {
            debug!(x = mv.x, y = mv.y, player = %mv.player, "move for missing cell ignored");
            continue;
        };
        if mv.total_weight() != u64::from(weight) {
            debug!(x = mv.x, y = mv.y, player = %mv.player, "split does not match weight");
            continue;
        }
        let leaves_grid = Direction::ALL.iter().any(|&d| {
            let (dx, dy) = d.offset();
            mv.count(d) > 0 && !in_bounds((mv.x + dx, mv.y + dy))
        });
        if leaves_grid {
            debug!(x = mv.x, y = mv.y, player = %mv.player, "split leaves the grid");
            continue;
        }

        remaining.remove(&key);
        for direction in Direction::ALL {
            let count = mv.count(direction);
            if count > 0 {
                push(&mut steps, (mv.x, mv.y), direction, &mv.player, count);
            }
        }
    }

    // Cells nobody moved stay put.
    for ((x, y, player), weight) in remaining {
        push(&mut steps, (x, y), Direction::Stay, &player, weight);
    }

    resolve_swaps(&mut fragments, &mut steps, rng);
    let mut cells = resolve_arrivals(fragments, &mut steps, rng);

    let vitamins: u32 = cells.iter().filter(|c| c.is_vitamin()).map(|c| c.weight).sum();
    let missing = world.vitamins.saturating_sub(vitamins) as usize;
    place_vitamins(&mut cells, world.size, missing, rng);

    (steps, cells)
}

/// Picks the winner of two weights; ties are a coin flip.
fn first_wins(a: u32, b: u32, rng: &mut ChaCha8Rng) -> bool {
    match a.cmp(&b) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => rng.gen_bool(0.5),
    }
}

fn mark(steps: &mut [AnimationStep], ids: &[usize], result: StepResult) {
    for &id in ids {
        steps[id].result = result;
    }
}

/// Two fragments crossing the same edge in opposite directions meet halfway.
fn resolve_swaps(fragments: &mut Vec<Fragment>, steps: &mut [AnimationStep], rng: &mut ChaCha8Rng) {
    loop {
        let crossing = (0..fragments.len()).find_map(|i| {
            (i + 1..fragments.len()).find_map(|j| {
                let (a, b) = (&fragments[i], &fragments[j]);
                let swap = a.origin != a.dest && a.origin == b.dest && b.origin == a.dest;
                swap.then_some((i, j))
            })
        });
        let Some((i, j)) = crossing else {
            return;
        };

        let b = fragments.remove(j);
        let a = fragments.remove(i);
        let merged = if a.player == b.player {
            let mut merged = a;
            merged.weight += b.weight;
            merged.steps.extend(b.steps);
            merged
        } else {
            let (mut winner, loser) = if first_wins(a.weight, b.weight, rng) {
                (a, b)
            } else {
                (b, a)
            };
            mark(steps, &loser.steps, StepResult::DiesMidway);
            winner.weight += loser.weight;
            winner
        };
        fragments.push(merged);
    }
}

/// Merges everything that lands on the same square.
fn resolve_arrivals(
    fragments: Vec<Fragment>,
    steps: &mut [AnimationStep],
    rng: &mut ChaCha8Rng,
) -> Vec<Cell> {
    let mut by_dest: Vec<((i32, i32), Vec<Fragment>)> = Vec::new();
    for fragment in fragments {
        match by_dest.iter_mut().find(|(dest, _)| *dest == fragment.dest) {
            Some((_, group)) => group.push(fragment),
            None => by_dest.push((fragment.dest, vec![fragment])),
        }
    }

    let mut cells = Vec::with_capacity(by_dest.len());
    for ((x, y), group) in by_dest {
        // Per-owner totals first, in arrival order.
        let mut owners: Vec<(String, u32, Vec<usize>)> = Vec::new();
        for fragment in group {
            match owners.iter_mut().find(|(p, _, _)| *p == fragment.player) {
                Some((_, weight, ids)) => {
                    *weight += fragment.weight;
                    ids.extend(fragment.steps);
                }
                None => owners.push((fragment.player, fragment.weight, fragment.steps)),
            }
        }

        while owners.len() > 1 {
            owners.sort_by(|a, b| b.1.cmp(&a.1));
            let second = owners.remove(1);
            let first = owners.remove(0);
            let (mut winner, loser) = if first_wins(first.1, second.1, rng) {
                (first, second)
            } else {
                (second, first)
            };
            mark(steps, &loser.2, StepResult::DiesArrival);
            winner.1 += loser.1;
            owners.insert(0, winner);
        }

        if let Some((player, weight, _)) = owners.pop() {
            cells.push(Cell { x, y, weight, player });
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(players: &[&str], size: u32, vitamins: u32) -> InitRequest {
        InitRequest {
            grid_size: size,
            number_of_vitamins: vitamins,
            players: players.iter().map(|p| p.to_string()).collect(),
            start_weight: 4,
        }
    }

    fn cell(x: i32, y: i32, weight: u32, player: &str) -> Cell {
        Cell { x, y, weight, player: player.to_string() }
    }

    fn world(size: u32, cells: Vec<Cell>) -> EngineWorld {
        EngineWorld { size, vitamins: 0, cells }
    }

    fn split(x: i32, y: i32, player: &str, up: u32, right: u32, stay: u32) -> CellMove {
        CellMove {
            x,
            y,
            player: player.to_string(),
            up,
            down: 0,
            left: 0,
            right,
            stay,
        }
    }

    #[tokio::test]
    async fn test_initial_placement_avoids_border() {
        let engine = SimEngine::new(7);
        let grid = engine.initialize(&request(&["a", "b", "c", "d"], 10, 3)).await.unwrap();

        let players: Vec<_> = grid.cells.iter().filter(|c| !c.is_vitamin()).collect();
        assert_eq!(players.len(), 4);
        for c in players {
            assert!((1..=8).contains(&c.x) && (1..=8).contains(&c.y));
            assert_eq!(c.weight, 4);
        }
        assert_eq!(grid.cells.iter().filter(|c| c.is_vitamin()).count(), 3);
    }

    #[tokio::test]
    async fn test_same_seed_same_world() {
        let a = SimEngine::new(99).initialize(&request(&["p1", "p2"], 8, 5)).await.unwrap();
        let b = SimEngine::new(99).initialize(&request(&["p1", "p2"], 8, 5)).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_valid_split_moves_weight() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let w = world(5, vec![cell(2, 2, 4, "p1")]);

        let (steps, cells) = resolve_turn(&w, &[split(2, 2, "p1", 1, 1, 2)], &mut rng);

        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.result == StepResult::Survives));
        assert!(cells.contains(&cell(2, 1, 1, "p1")));
        assert!(cells.contains(&cell(3, 2, 1, "p1")));
        assert!(cells.contains(&cell(2, 2, 2, "p1")));
    }

    #[test]
    fn test_invalid_moves_are_ignored() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let w = world(3, vec![cell(0, 0, 4, "p1")]);

        let moves = [
            // wrong total
            split(0, 0, "p1", 0, 1, 1),
            // leaves the grid upwards
            split(0, 0, "p1", 1, 0, 3),
            // not this player's cell
            split(0, 0, "p2", 0, 0, 4),
        ];
        let (steps, cells) = resolve_turn(&w, &moves, &mut rng);

        assert_eq!(cells, vec![cell(0, 0, 4, "p1")]);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].direction, Direction::Stay);
    }

    #[test]
    fn test_heavier_owner_wins_arrival() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let w = world(5, vec![cell(1, 2, 5, "big"), cell(3, 2, 2, "small")]);

        let moves = [
            split(1, 2, "big", 0, 5, 0),
            CellMove {
                left: 2,
                ..CellMove::stay(3, 2, "small", 0)
            },
        ];
        let (steps, cells) = resolve_turn(&w, &moves, &mut rng);

        assert_eq!(cells, vec![cell(2, 2, 7, "big")]);
        let small = steps.iter().find(|s| s.player == "small").unwrap();
        assert_eq!(small.result, StepResult::DiesArrival);
    }

    #[test]
    fn test_head_on_swap_meets_midway() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let w = world(5, vec![cell(1, 1, 3, "a"), cell(2, 1, 1, "b")]);

        let moves = [
            split(1, 1, "a", 0, 3, 0),
            CellMove {
                left: 1,
                ..CellMove::stay(2, 1, "b", 0)
            },
        ];
        let (steps, cells) = resolve_turn(&w, &moves, &mut rng);

        assert_eq!(cells, vec![cell(2, 1, 4, "a")]);
        let b = steps.iter().find(|s| s.player == "b").unwrap();
        assert_eq!(b.result, StepResult::DiesMidway);
    }

    #[test]
    fn test_vitamins_replenished() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let w = EngineWorld {
            size: 4,
            vitamins: 2,
            cells: vec![cell(1, 1, 4, "p1"), cell(1, 2, 1, VITAMIN_OWNER)],
        };

        // p1 eats the vitamin below it
        let moves = [CellMove {
            down: 4,
            ..CellMove::stay(1, 1, "p1", 0)
        }];
        let (_, cells) = resolve_turn(&w, &moves, &mut rng);

        assert!(cells.contains(&cell(1, 2, 5, "p1")));
        assert_eq!(cells.iter().filter(|c| c.is_vitamin()).count(), 2);
    }

    #[tokio::test]
    async fn test_fault_injection_and_history() {
        let engine = SimEngine::new(5);
        engine.initialize(&request(&["p1"], 6, 0)).await.unwrap();
        engine.fail_next(1);

        let moves = vec![CellMove::stay(0, 0, "p1", 1)];
        assert!(engine.compute_turn(&moves).await.is_err());
        assert!(engine.compute_turn(&moves).await.is_ok());

        assert_eq!(engine.turn_calls(), 2);
        assert_eq!(engine.history().len(), 2);
    }

    #[tokio::test]
    async fn test_turn_before_init_fails() {
        let engine = SimEngine::new(5);
        let err = engine.compute_turn(&[]).await.unwrap_err();
        assert!(matches!(err, EnvError::Status { status: 409, .. }));
    }
}
