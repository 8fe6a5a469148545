//! Common types shared across the engine boundary.

use serde::{Deserialize, Serialize};

/// Owner name the engine uses for vitamin cells.
pub const VITAMIN_OWNER: &str = "vitamin";

/// One of the five directions a cell's weight can be split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Stay,
}

impl Direction {
    /// All directions in wire order.
    pub const ALL: [Direction; 5] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
        Direction::Stay,
    ];

    /// Grid offset for this direction (y grows downwards).
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
            Direction::Stay => (0, 0),
        }
    }
}

/// The split of one cell's weight across the five directions.
///
/// Accepts both the client field names (`up`, `down`, ...) and the
/// engine's (`move_up`, `move_down`, ...). Missing counts default to 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMove {
    pub x: i32,
    pub y: i32,
    pub player: String,
    #[serde(default, alias = "move_up")]
    pub up: u32,
    #[serde(default, alias = "move_down")]
    pub down: u32,
    #[serde(default, alias = "move_left")]
    pub left: u32,
    #[serde(default, alias = "move_right")]
    pub right: u32,
    #[serde(default, alias = "move_stay")]
    pub stay: u32,
}

impl CellMove {
    /// Creates a move that keeps the whole weight in place.
    pub fn stay(x: i32, y: i32, player: impl Into<String>, weight: u32) -> Self {
        Self {
            x,
            y,
            player: player.into(),
            up: 0,
            down: 0,
            left: 0,
            right: 0,
            stay: weight,
        }
    }

    /// Count assigned to a direction.
    pub fn count(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Up => self.up,
            Direction::Down => self.down,
            Direction::Left => self.left,
            Direction::Right => self.right,
            Direction::Stay => self.stay,
        }
    }

    /// Sum of all five counts. Must equal the moved cell's weight.
    pub fn total_weight(&self) -> u64 {
        Direction::ALL
            .iter()
            .map(|d| u64::from(self.count(*d)))
            .sum()
    }
}

/// An occupied grid cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
    pub weight: u32,
    pub player: String,
}

impl Cell {
    /// Returns true if this cell is a vitamin rather than a player cell.
    pub fn is_vitamin(&self) -> bool {
        self.player == VITAMIN_OWNER
    }
}

/// Latest simulation snapshot: an N x N grid and its occupied cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldGrid {
    pub size: u32,
    pub cells: Vec<Cell>,
}

impl WorldGrid {
    /// Creates a grid snapshot.
    pub fn new(size: u32, cells: Vec<Cell>) -> Self {
        Self { size, cells }
    }

    /// Total weight owned by `player`.
    pub fn weight_of(&self, player: &str) -> u64 {
        self.cells
            .iter()
            .filter(|c| c.player == player)
            .map(|c| u64::from(c.weight))
            .sum()
    }

    /// Cells owned by `player`.
    pub fn cells_of<'a>(&'a self, player: &'a str) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells.iter().filter(move |c| c.player == player)
    }
}

/// Parameters sent to the engine to create a new world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub grid_size: u32,
    pub number_of_vitamins: u32,
    pub players: Vec<String>,
    pub start_weight: u32,
}

/// Result of one engine turn.
///
/// The animation trace is opaque to the orchestrator; it is forwarded to
/// clients unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub animation: serde_json::Value,
    pub cells: Vec<Cell>,
}
