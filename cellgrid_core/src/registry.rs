//! Player registry: connected names and the roster frozen at game start.

use crate::error::{OrchestratorError, OrchestratorResult};
use std::sync::Arc;
use std::time::Duration;

/// A connected participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    /// Unique, case-sensitive name
    pub name: String,

    /// Context time at which the player first joined
    pub joined_at: Duration,
}

/// Connected players in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct PlayerRegistry {
    players: Vec<Player>,
}

impl PlayerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`. Joining twice is a no-op.
    ///
    /// # Returns
    /// * `Ok(true)` - The player was added
    /// * `Ok(false)` - The player was already connected
    /// * `Err(Validation)` - The name is empty or whitespace
    pub fn join(&mut self, name: &str, now: Duration) -> OrchestratorResult<bool> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::validation("Missing 'name' field"));
        }
        if self.contains(name) {
            return Ok(false);
        }
        self.players.push(Player {
            name: name.to_string(),
            joined_at: now,
        });
        Ok(true)
    }

    /// Returns true if `name` is connected.
    pub fn contains(&self, name: &str) -> bool {
        self.players.iter().any(|p| p.name == name)
    }

    /// Connected names in join order.
    pub fn names(&self) -> Vec<String> {
        self.players.iter().map(|p| p.name.clone()).collect()
    }

    /// Looks up a connected player.
    pub fn get(&self, name: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Freezes the current players into a roster.
    pub fn roster(&self) -> Roster {
        Roster::new(self.names())
    }
}

/// The fixed set of players eligible to complete a turn.
///
/// Cheap to clone; players joining after the freeze are not part of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster(Arc<[String]>);

impl Roster {
    /// Creates a roster, dropping duplicate names but keeping first-seen order.
    pub fn new(names: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self(unique.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Index of `name` in roster order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Roster {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}
