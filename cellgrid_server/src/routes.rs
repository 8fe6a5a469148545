//! HTTP surface of the turn controller.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use cellgrid_core::{BeginParams, OrchestratorError, TurnController};
use cellgrid_env::{CellMove, SimulationGateway, TokioContext};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared handler state: one controller per process.
pub struct AppState<Gw: SimulationGateway> {
    pub controller: TurnController<TokioContext, Gw>,
}

impl<Gw: SimulationGateway> Clone for AppState<Gw> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
        }
    }
}

pub fn build_router<Gw: SimulationGateway>(state: AppState<Gw>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/players", get(list_players::<Gw>))
        .route("/join", post(join::<Gw>))
        .route("/begin", post(begin::<Gw>))
        .route("/moves", post(submit_moves::<Gw>))
        .route("/state", get(get_state::<Gw>))
        .route("/stop", post(stop::<Gw>))
        .route("/events", get(events::<Gw>))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true, "service": "cellgrid-server"}))
}

async fn list_players<Gw: SimulationGateway>(State(state): State<AppState<Gw>>) -> Json<Value> {
    Json(json!({ "connectedPlayers": state.controller.players() }))
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    #[serde(default)]
    name: Option<String>,
}

async fn join<Gw: SimulationGateway>(
    State(state): State<AppState<Gw>>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = req.name.unwrap_or_default();
    let players = state.controller.join(&name)?;
    Ok(Json(json!({ "message": "Player joined", "players": players })))
}

async fn begin<Gw: SimulationGateway>(
    State(state): State<AppState<Gw>>,
    Json(params): Json<BeginParams>,
) -> Result<Json<Value>, ApiError> {
    let grid = state.controller.begin(params).await?;
    Ok(Json(json!({ "message": "Game started", "grid": grid.cells })))
}

#[derive(Debug, Deserialize)]
struct MovesRequest {
    #[serde(default)]
    player: String,
    /// Anything but a JSON integer is treated as a stale turn
    #[serde(default)]
    turn: Value,
    #[serde(default)]
    moves: Vec<CellMove>,
}

async fn submit_moves<Gw: SimulationGateway>(
    State(state): State<AppState<Gw>>,
    Json(req): Json<MovesRequest>,
) -> Result<Json<Value>, ApiError> {
    // Turns start at 1, so 0 is never current and the controller answers
    // with the real turn (or NotRunning).
    let turn = req.turn.as_u64().unwrap_or(0);
    let ack = state.controller.submit(&req.player, turn, req.moves).await?;
    Ok(Json(json!({
        "message": "Moves recorded",
        "turn": ack.turn,
        "finalized": ack.finalized,
    })))
}

async fn get_state<Gw: SimulationGateway>(State(state): State<AppState<Gw>>) -> Json<Value> {
    let snapshot = state.controller.snapshot();
    let config = snapshot.config.unwrap_or_default();
    Json(json!({
        "turn": snapshot.turn,
        "grid": snapshot.grid.cells,
        "grid_size": config.grid_size,
        "gridSize": config.grid_size,
        "timeBetweenMoves": config.turn_deadline_secs,
        "turnDeadlineSeconds": config.turn_deadline_secs,
        "players": snapshot.roster,
        "phase": snapshot.phase,
        "submitted": snapshot.submitted,
        "deadlineRemainingMs": snapshot.deadline_remaining.map(|d| d.as_millis() as u64),
    }))
}

async fn stop<Gw: SimulationGateway>(
    State(state): State<AppState<Gw>>,
) -> Result<Json<Value>, ApiError> {
    if !state.controller.stop() {
        return Err(OrchestratorError::NotRunning.into());
    }
    Ok(Json(json!({ "message": "Game stopped" })))
}

async fn events<Gw: SimulationGateway>(
    State(state): State<AppState<Gw>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!(subscribers = state.controller.events().subscriber_count() + 1, "event stream opened");
    let stream = BroadcastStream::new(state.controller.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Event::default().event(event.name()).json_data(&event)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            OrchestratorError::StaleTurn { current_turn } => Self {
                status: StatusCode::CONFLICT,
                body: json!({ "error": "Invalid turn", "currentTurn": current_turn }),
            },
            e @ OrchestratorError::UnknownPlayer(_) => Self::new(StatusCode::FORBIDDEN, e.to_string()),
            e @ OrchestratorError::Upstream(_) => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
            e @ (OrchestratorError::NotRunning | OrchestratorError::AlreadyRunning) => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, body = %self.body, "request failed");
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cellgrid_core::ControllerConfig;
    use cellgrid_sim::SimEngine;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<SimEngine>) {
        let engine = Arc::new(SimEngine::new(7));
        let controller = TurnController::new(
            TokioContext::shared(),
            Arc::clone(&engine),
            ControllerConfig::default(),
        );
        (build_router(AppState { controller }), engine)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_join_lists_players() {
        let (app, _) = app();
        let (status, body) = call(&app, "POST", "/join", Some(json!({"name": "alice"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["players"], json!(["alice"]));

        call(&app, "POST", "/join", Some(json!({"name": "alice"}))).await;
        let (_, body) = call(&app, "GET", "/players", None).await;
        assert_eq!(body["connectedPlayers"], json!(["alice"]));
    }

    #[tokio::test]
    async fn test_join_without_name_is_bad_request() {
        let (app, _) = app();
        let (status, body) = call(&app, "POST", "/join", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn test_full_turn_over_http() {
        let (app, engine) = app();
        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        call(&app, "POST", "/join", Some(json!({"name": "p2"}))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/begin",
            Some(json!({"grid_size": 10, "number_of_vitamins": 3, "start_weight": 4, "time_between_moves": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["grid"].as_array().unwrap().len(), 5);

        let (_, state) = call(&app, "GET", "/state", None).await;
        assert_eq!(state["turn"], 1);
        assert_eq!(state["phase"], "open");
        assert_eq!(state["gridSize"], 10);
        assert_eq!(state["grid_size"], 10);
        assert_eq!(state["turnDeadlineSeconds"], 0);
        assert_eq!(state["players"], json!(["p1", "p2"]));

        for player in ["p1", "p2"] {
            let (status, body) = call(
                &app,
                "POST",
                "/moves",
                Some(json!({"player": player, "turn": 1, "moves": []})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["turn"], 1);
        }

        let (_, state) = call(&app, "GET", "/state", None).await;
        assert_eq!(state["turn"], 2);
        assert_eq!(engine.turn_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_turn_reports_current_turn() {
        let (app, _) = app();
        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        call(&app, "POST", "/begin", Some(json!({}))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/moves",
            Some(json!({"player": "p1", "turn": 9, "moves": []})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Invalid turn");
        assert_eq!(body["currentTurn"], 1);
    }

    #[tokio::test]
    async fn test_non_integer_turn_reports_current_turn() {
        let (app, _) = app();
        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        call(&app, "POST", "/begin", Some(json!({}))).await;

        for turn in [json!("1"), json!(-1), json!(1.5), json!(null)] {
            let (status, body) = call(
                &app,
                "POST",
                "/moves",
                Some(json!({"player": "p1", "turn": turn, "moves": []})),
            )
            .await;
            assert_eq!(status, StatusCode::CONFLICT);
            assert_eq!(body["currentTurn"], 1);
        }

        let (status, body) = call(&app, "POST", "/moves", Some(json!({"player": "p1", "moves": []}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["currentTurn"], 1);
    }

    #[tokio::test]
    async fn test_begin_without_players_is_bad_request() {
        let (app, engine) = app();
        let (status, _) = call(&app, "POST", "/begin", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(engine.init_calls(), 0);
    }

    #[tokio::test]
    async fn test_begin_twice_conflicts() {
        let (app, _) = app();
        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        call(&app, "POST", "/begin", Some(json!({}))).await;
        let (status, _) = call(&app, "POST", "/begin", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_begin_with_bad_size_is_bad_request() {
        let (app, engine) = app();
        let (status, _) = call(&app, "POST", "/begin", Some(json!({"grid_size": -3}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(engine.init_calls(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_is_bad_gateway() {
        let (app, engine) = app();
        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        engine.fail_next_init(1);
        let (status, _) = call(&app, "POST", "/begin", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (_, state) = call(&app, "GET", "/state", None).await;
        assert_eq!(state["phase"], "idle");
    }

    #[tokio::test]
    async fn test_stop() {
        let (app, _) = app();
        let (status, _) = call(&app, "POST", "/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        call(&app, "POST", "/begin", Some(json!({}))).await;
        let (status, _) = call(&app, "POST", "/stop", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, state) = call(&app, "GET", "/state", None).await;
        assert_eq!(state["phase"], "idle");
    }

    #[tokio::test]
    async fn test_unknown_player_forbidden() {
        let (app, _) = app();
        call(&app, "POST", "/join", Some(json!({"name": "p1"}))).await;
        call(&app, "POST", "/begin", Some(json!({}))).await;

        let (status, _) = call(
            &app,
            "POST",
            "/moves",
            Some(json!({"player": "mallory", "turn": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
