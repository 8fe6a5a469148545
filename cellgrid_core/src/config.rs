//! Session and controller configuration.

use crate::error::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Grid size used when `begin` omits it.
pub const DEFAULT_GRID_SIZE: u32 = 10;
/// Vitamin count used when `begin` omits it.
pub const DEFAULT_VITAMINS_COUNT: u32 = 3;
/// Starting cell weight used when `begin` omits it.
pub const DEFAULT_START_WEIGHT: u32 = 4;
/// Longest accepted turn deadline (one day). Larger requests are clamped.
pub const MAX_TURN_DEADLINE_SECS: u64 = 86_400;

/// Parameters for one game session. Immutable once the session starts.
///
/// Serialized with the engine/client field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub grid_size: u32,
    #[serde(rename = "number_of_vitamins")]
    pub vitamins_count: u32,
    pub start_weight: u32,
    /// Seconds before a turn closes on its own (0 = no deadline)
    #[serde(rename = "time_between_moves")]
    pub turn_deadline_secs: u64,
}

impl GameConfig {
    /// Creates a validated config.
    pub fn new(
        grid_size: u32,
        vitamins_count: u32,
        start_weight: u32,
        turn_deadline_secs: u64,
    ) -> OrchestratorResult<Self> {
        let config = Self {
            grid_size,
            vitamins_count,
            start_weight,
            turn_deadline_secs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that every size parameter is a positive integer.
    pub fn validate(&self) -> OrchestratorResult<()> {
        for (name, value) in [
            ("grid_size", self.grid_size),
            ("number_of_vitamins", self.vitamins_count),
            ("start_weight", self.start_weight),
        ] {
            if value == 0 {
                return Err(OrchestratorError::validation(format!(
                    "{name} must be a positive integer"
                )));
            }
        }
        if self.turn_deadline_secs > MAX_TURN_DEADLINE_SECS {
            return Err(OrchestratorError::validation(format!(
                "time_between_moves must be at most {MAX_TURN_DEADLINE_SECS} seconds"
            )));
        }
        Ok(())
    }

    /// Turn deadline, or `None` when turns only end by roster completion.
    pub fn deadline(&self) -> Option<Duration> {
        (self.turn_deadline_secs > 0).then(|| Duration::from_secs(self.turn_deadline_secs))
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            vitamins_count: DEFAULT_VITAMINS_COUNT,
            start_weight: DEFAULT_START_WEIGHT,
            turn_deadline_secs: 0,
        }
    }
}

/// Raw `begin` request body.
///
/// Values arrive as loosely typed JSON (numbers or numeric strings) and are
/// coerced by [`BeginParams::into_config`]:
/// - a missing size parameter takes its default
/// - a present size parameter must be a positive integer
/// - the deadline falls back to 0 when missing, negative, or not numeric,
///   and is clamped to [`MAX_TURN_DEADLINE_SECS`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeginParams {
    #[serde(default, alias = "gridSize")]
    pub grid_size: Option<Value>,
    #[serde(default, alias = "vitaminsCount")]
    pub number_of_vitamins: Option<Value>,
    #[serde(default, alias = "startWeight")]
    pub start_weight: Option<Value>,
    #[serde(default, alias = "turnDeadlineSeconds")]
    pub time_between_moves: Option<Value>,
}

impl BeginParams {
    /// Coerces the raw values into a validated [`GameConfig`].
    pub fn into_config(self) -> OrchestratorResult<GameConfig> {
        GameConfig::new(
            positive_or_default("grid_size", self.grid_size, DEFAULT_GRID_SIZE)?,
            positive_or_default(
                "number_of_vitamins",
                self.number_of_vitamins,
                DEFAULT_VITAMINS_COUNT,
            )?,
            positive_or_default("start_weight", self.start_weight, DEFAULT_START_WEIGHT)?,
            deadline_or_zero(self.time_between_moves),
        )
    }
}

fn positive_or_default(name: &str, value: Option<Value>, default: u32) -> OrchestratorResult<u32> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(default),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };

    match parsed {
        Some(v) if v > 0 && v <= u64::from(u32::MAX) => Ok(v as u32),
        _ => Err(OrchestratorError::validation(format!(
            "{name} must be a positive integer"
        ))),
    }
}

fn deadline_or_zero(value: Option<Value>) -> u64 {
    let secs = match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    };
    secs.min(MAX_TURN_DEADLINE_SECS)
}

/// Tuning for the turn controller itself.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Extra engine attempts after a failed turn computation (default: 1)
    pub finalize_retries: u32,

    /// Buffered events per subscriber before lagging (default: 256)
    pub broadcast_capacity: usize,

    /// Finalize on roster completion even when a deadline is armed
    /// (default: false, turns with a deadline wait for it)
    pub early_completion: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            finalize_retries: 1,
            broadcast_capacity: 256,
            early_completion: false,
        }
    }
}

impl ControllerConfig {
    /// Set the number of engine retries per turn.
    pub fn with_finalize_retries(mut self, retries: u32) -> Self {
        self.finalize_retries = retries;
        self
    }

    /// Set the broadcast buffer size (at least 1).
    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    /// Allow roster completion to close turns that have a deadline.
    pub fn with_early_completion(mut self, enabled: bool) -> Self {
        self.early_completion = enabled;
        self
    }
}
