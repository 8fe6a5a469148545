//! Production SimulationGateway speaking JSON over HTTP.

use crate::error::EnvError;
use crate::gateway::SimulationGateway;
use crate::types::{Cell, CellMove, InitRequest, TurnOutcome, WorldGrid};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Longest response body echoed back inside an error.
const MAX_ERROR_BODY: usize = 512;

/// Move in the engine's wire format (`move_*` field names).
#[derive(Debug, Clone, Serialize)]
struct EngineMove<'a> {
    x: i32,
    y: i32,
    player: &'a str,
    move_up: u32,
    move_down: u32,
    move_left: u32,
    move_right: u32,
    move_stay: u32,
}

impl<'a> From<&'a CellMove> for EngineMove<'a> {
    fn from(mv: &'a CellMove) -> Self {
        Self {
            x: mv.x,
            y: mv.y,
            player: &mv.player,
            move_up: mv.up,
            move_down: mv.down,
            move_left: mv.left,
            move_right: mv.right,
            move_stay: mv.stay,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    grid: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct MovesResponse {
    move_animation: serde_json::Value,
    new_grid: Vec<Cell>,
}

/// Gateway to an engine service exposing `POST /init` and `POST /moves`.
///
/// Every request is bounded by the configured timeout; expiry surfaces as
/// `EnvError::Timeout`.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpGateway {
    /// Creates a gateway for the engine at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EnvError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnvError::unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }

    /// Returns the engine base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn map_send_error(&self, err: reqwest::Error) -> EnvError {
        if err.is_timeout() {
            EnvError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_builder() {
            EnvError::SerializationError(err.to_string())
        } else {
            EnvError::unreachable(err.to_string())
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, EnvError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path);
        debug!(%url, "calling engine");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            return Err(EnvError::Status {
                status: status.as_u16(),
                body: truncate_body(text),
            });
        }

        serde_json::from_str(&text).map_err(EnvError::malformed)
    }
}

/// Cuts an error body to at most `MAX_ERROR_BODY` bytes on a char boundary.
fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl SimulationGateway for HttpGateway {
    async fn initialize(&self, request: &InitRequest) -> Result<WorldGrid, EnvError> {
        let response: InitResponse = self.post_json("init", request).await?;
        Ok(WorldGrid::new(request.grid_size, response.grid))
    }

    async fn compute_turn(&self, moves: &[CellMove]) -> Result<TurnOutcome, EnvError> {
        let wire: Vec<EngineMove<'_>> = moves.iter().map(EngineMove::from).collect();
        let response: MovesResponse = self.post_json("moves", &wire).await?;
        Ok(TurnOutcome {
            animation: response.move_animation,
            cells: response.new_grid,
        })
    }
}
