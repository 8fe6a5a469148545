//! Move aggregation for the open turn.
//!
//! Holds at most one [`MoveSubmission`] per player. A resubmission within the
//! same turn replaces the earlier one; submissions for any other turn, or
//! after the turn has been drained, are rejected as stale.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::Roster;
use cellgrid_env::CellMove;

/// One player's moves for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveSubmission {
    pub player: String,
    pub turn: u64,
    pub moves: Vec<CellMove>,
}

/// What `put` did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// First submission from this player this turn
    Inserted,
    /// Replaced the player's earlier submission
    Replaced,
}

/// Per-turn store of the latest submission per player.
#[derive(Debug, Clone, Default)]
pub struct MoveAggregator {
    turn: u64,
    accepting: bool,
    entries: Vec<MoveSubmission>,
}

impl MoveAggregator {
    /// Creates a closed aggregator. Call [`open`](Self::open) before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting for `turn`, discarding anything left over.
    pub fn open(&mut self, turn: u64) {
        self.turn = turn;
        self.accepting = true;
        self.entries.clear();
    }

    /// Stops collecting without draining.
    pub fn close(&mut self) {
        self.accepting = false;
        self.entries.clear();
    }

    /// Turn currently (or last) collected for.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Stores a submission, overwriting the player's previous one.
    pub fn put(&mut self, submission: MoveSubmission) -> OrchestratorResult<PutOutcome> {
        if !self.accepting || submission.turn != self.turn {
            return Err(OrchestratorError::StaleTurn {
                current_turn: self.turn,
            });
        }

        match self.entries.iter_mut().find(|e| e.player == submission.player) {
            Some(existing) => {
                *existing = submission;
                Ok(PutOutcome::Replaced)
            }
            None => {
                self.entries.push(submission);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    /// Returns true if `player` has submitted this turn.
    pub fn has_submitted(&self, player: &str) -> bool {
        self.entries.iter().any(|e| e.player == player)
    }

    /// Returns true iff every roster member has a stored submission.
    pub fn is_complete(&self, roster: &Roster) -> bool {
        roster.iter().all(|p| self.has_submitted(p))
    }

    /// Names that have submitted this turn, in first-submission order.
    pub fn submitted(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.player.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes every stored submission and stops accepting for this turn.
    ///
    /// Only the turn controller calls this, once per turn, inside its
    /// transition guard.
    pub fn drain_and_reset(&mut self) -> Vec<MoveSubmission> {
        self.accepting = false;
        std::mem::take(&mut self.entries)
    }
}
