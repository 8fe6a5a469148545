//! Deterministic scenarios for the turn controller.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// DST-001: every player submits concurrently, roster completion closes turns
    RosterRace,

    /// DST-002: the last submission races the deadline
    DeadlineRace,

    /// DST-003: engine down for a whole turn, session fails open
    UpstreamOutage,

    /// DST-004: a player joins after the roster was frozen
    LateJoiner,

    /// DST-005: a cancelled deadline elapses during the next turn
    StaleTimer,

    /// DST-006: a player overwrites its own submission
    Resubmission,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RosterRace,
            ScenarioId::DeadlineRace,
            ScenarioId::UpstreamOutage,
            ScenarioId::LateJoiner,
            ScenarioId::StaleTimer,
            ScenarioId::Resubmission,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RosterRace => "roster_race",
            ScenarioId::DeadlineRace => "deadline_race",
            ScenarioId::UpstreamOutage => "upstream_outage",
            ScenarioId::LateJoiner => "late_joiner",
            ScenarioId::StaleTimer => "stale_timer",
            ScenarioId::Resubmission => "resubmission",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RosterRace => "Concurrent submissions, exactly one finalization per turn",
            ScenarioId::DeadlineRace => "Final submission vs. deadline expiry, one winner per turn",
            ScenarioId::UpstreamOutage => "Engine fails past the retry budget, turn degrades and advances",
            ScenarioId::LateJoiner => "Joining mid-game neither gates nor enters the running roster",
            ScenarioId::StaleTimer => "A superseded deadline never closes the following turn",
            ScenarioId::Resubmission => "Only the latest submission per player reaches the engine",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "roster_race" | "rosterrace" | "dst-001" => Ok(ScenarioId::RosterRace),
            "deadline_race" | "deadlinerace" | "dst-002" => Ok(ScenarioId::DeadlineRace),
            "upstream_outage" | "upstreamoutage" | "dst-003" => Ok(ScenarioId::UpstreamOutage),
            "late_joiner" | "latejoiner" | "dst-004" => Ok(ScenarioId::LateJoiner),
            "stale_timer" | "staletimer" | "dst-005" => Ok(ScenarioId::StaleTimer),
            "resubmission" | "dst-006" => Ok(ScenarioId::Resubmission),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
