//! The HTTP/WebSocket facade: the unchanged external surface of §6 laid over
//! the bus/ledger/store/orchestrator collaborators. Grounded in the teacher's
//! `tandem-server` (`AppState` held behind `State<T>`, `app_router` building
//! one `Router` from many `.route(...)` calls, `serve` binding a listener and
//! racing it against `ctrl_c` for graceful shutdown) but trimmed to the
//! endpoints named in §6 (plus `POST /projects/{id}/cancel`, needed to
//! reach the orchestrator's cancellation semantics) instead of the
//! teacher's much larger surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use coord_bus::Bus;
use coord_ledger::CostLedger;
use coord_orchestrator::Orchestrator;
use coord_store::TaskStore;
use coord_types::{BudgetCaps, CoreError, Project, ProjectId, Stage, TaskId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

/// Everything a handler needs, generic over the bus backend so a future
/// networked `Bus` implementation plugs in without touching this crate.
pub struct AppState<B: Bus + 'static> {
    pub bus: Arc<B>,
    pub store: Arc<TaskStore>,
    pub ledger: Arc<CostLedger>,
    pub orchestrator: Arc<Orchestrator<B>>,
}

impl<B: Bus + 'static> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    retryable: bool,
    request_id: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::BudgetExhausted(_) => StatusCode::PAYMENT_REQUIRED,
        CoreError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Maps a `CoreError` to its HTTP response and, per §7's "all failures
/// increment a per-kind counter on the bus", bumps `errors.<kind>` first.
async fn error_response<B: Bus>(bus: &B, err: CoreError) -> ApiError {
    let code = err.code();
    if let Err(counter_err) = bus.increment_counter(&format!("errors.{code}"), 1).await {
        warn!(error = %counter_err, "failed to increment error counter");
    }
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "internal error");
    }
    let body = ErrorBody {
        code: code.to_string(),
        message: err.to_string(),
        retryable: err.retryable(),
        request_id: uuid::Uuid::new_v4().to_string(),
    };
    (status, Json(body))
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
    requirements: Vec<String>,
    story_points: u32,
    budget: BudgetCaps,
    #[serde(default)]
    stages: Vec<Stage>,
}

async fn create_project<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    match state
        .orchestrator
        .submit_project(req.name, req.requirements, req.story_points, req.budget, req.stages)
        .await
    {
        Ok(project) => Ok(Json(project)),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

async fn get_project<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<Project>, ApiError> {
    match state.store.load_project(project_id).await {
        Ok(project) => Ok(Json(project)),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

async fn execute_project<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<StatusCode, ApiError> {
    match state.orchestrator.execute_project(project_id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

async fn pause_project<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<StatusCode, ApiError> {
    match state.orchestrator.pause_project(project_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

async fn resume_project<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<StatusCode, ApiError> {
    match state.orchestrator.resume_project(project_id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

async fn cancel_project<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<StatusCode, ApiError> {
    match state.orchestrator.cancel_project(project_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

async fn list_tasks<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.list_tasks(project_id).await {
        Ok(tasks) => Ok(Json(tasks)),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

/// Not scoped under a project in its path (§6), so it goes through
/// `TaskStore::find_task` rather than `load_task`.
async fn get_task<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(task_id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.find_task(task_id).await {
        Ok(task) => Ok(Json(task)),
        Err(err) => Err(error_response(&*state.bus, err).await),
    }
}

#[derive(Debug, Serialize)]
struct CostsResponse {
    daily_spent: f64,
    monthly_spent: f64,
    daily_fraction: f64,
    monthly_fraction: f64,
    phase: coord_types::BudgetPhase,
}

async fn get_costs<B: Bus + 'static>(
    State(state): State<AppState<B>>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<CostsResponse>, ApiError> {
    let daily_spent = match state.ledger.daily_spent(project_id).await {
        Ok(v) => v,
        Err(err) => return Err(error_response(&*state.bus, err).await),
    };
    let monthly_spent = match state.ledger.monthly_spent(project_id).await {
        Ok(v) => v,
        Err(err) => return Err(error_response(&*state.bus, err).await),
    };
    let status = match state.ledger.budget_status(project_id).await {
        Ok(v) => v,
        Err(err) => return Err(error_response(&*state.bus, err).await),
    };
    Ok(Json(CostsResponse {
        daily_spent,
        monthly_spent,
        daily_fraction: status.daily,
        monthly_fraction: status.monthly,
        phase: status.phase,
    }))
}

async fn global_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ws_handler<B: Bus + 'static>(
    ws: WebSocketUpgrade,
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState<B>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_project_events(socket, state, project_id))
}

/// Fans bus events for one project out over a WebSocket. A `BroadcastStream`
/// wraps the bus's single broadcast channel (mirrors the teacher's
/// `EventBus`/`StreamHub` fanout, §4.1); the subscriber just filters by
/// `project_id` since the channel itself carries every project's events.
async fn stream_project_events<B: Bus + 'static>(socket: WebSocket, state: AppState<B>, project_id: ProjectId) {
    let (mut sink, mut source) = socket.split();
    let mut events = BroadcastStream::new(state.bus.subscribe()).filter_map(move |item| {
        let payload = match item {
            Ok(event) if event.project_id() == project_id => serde_json::to_string(&event).ok(),
            _ => None,
        };
        async move { payload }
    });

    let mut forward = tokio::spawn(async move {
        while let Some(payload) = events.next().await {
            if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    forward.abort();
}

pub fn app_router<B: Bus + 'static>(state: AppState<B>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/health", get(global_health))
        .route("/projects", post(create_project::<B>))
        .route("/projects/{id}", get(get_project::<B>))
        .route("/projects/{id}/execute", post(execute_project::<B>))
        .route("/projects/{id}/pause", post(pause_project::<B>))
        .route("/projects/{id}/resume", post(resume_project::<B>))
        .route("/projects/{id}/cancel", post(cancel_project::<B>))
        .route("/projects/{id}/tasks", get(list_tasks::<B>))
        .route("/projects/{id}/costs", get(get_costs::<B>))
        .route("/projects/{id}/ws", get(ws_handler::<B>))
        .route("/tasks/{id}", get(get_task::<B>))
        .layer(cors)
        .with_state(state)
}

/// Binds `addr` and serves until ctrl-c, mirroring the teacher's `serve()`
/// shutdown idiom. Background collaborators (the bus sweep, the arbitrator
/// drain loop, the orchestrator's per-project stage machines) are spawned by
/// the caller before this is reached; this fn owns only the HTTP listener.
pub async fn serve<B: Bus + 'static>(addr: SocketAddr, state: AppState<B>) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "coord-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_client::InferenceClient;
    use coord_bus::InProcessBus;
    use coord_orchestrator::OrchestratorConfig;
    use coord_router::ModelRouter;
    use coord_types::EconomicMode;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn test_state() -> AppState<InProcessBus> {
        let dir = tempdir().unwrap();
        let bus = InProcessBus::spawn(Duration::from_secs(300), Duration::from_secs(120));
        let store = Arc::new(TaskStore::new(dir.path().join("tasks")).unwrap());
        let ledger = Arc::new(CostLedger::new(dir.path().join("ledger"), vec![], 100.0, 1000.0).unwrap());
        let router = Arc::new(ModelRouter::new(vec![], coord_types::Tier::Premium, coord_types::Tier::Premium));
        let client = Arc::new(InferenceClient::new(vec![], ledger.clone(), 5, Duration::from_secs(30)));
        let orchestrator = Arc::new(Orchestrator::new(
            bus.clone(),
            store.clone(),
            ledger.clone(),
            router,
            client,
            OrchestratorConfig::default(),
            EconomicMode::Balanced,
        ));
        AppState { bus, store, ledger, orchestrator }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = test_state().await;
        let app = app_router(state);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_project_returns_not_found_with_stable_code() {
        let state = test_state().await;
        let app = app_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/projects/{}", ProjectId::new()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_project_returns_the_submitted_project() {
        let state = test_state().await;
        let app = app_router(state);
        let body = serde_json::to_vec(&serde_json::json!({
            "name": "demo",
            "requirements": ["build a thing"],
            "story_points": 3,
            "budget": {"currency": "USD", "daily": 10.0, "monthly": 100.0},
            "stages": [],
        }))
        .unwrap();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/projects")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_marks_the_project_failed() {
        let state = test_state().await;
        let app = app_router(state);
        let body = serde_json::to_vec(&serde_json::json!({
            "name": "demo",
            "requirements": ["build a thing"],
            "story_points": 3,
            "budget": {"currency": "USD", "daily": 10.0, "monthly": 100.0},
            "stages": [],
        }))
        .unwrap();
        let create_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/projects")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX).await.unwrap();
        let created: Project = serde_json::from_slice(&bytes).unwrap();

        let cancel_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/projects/{}/cancel", created.id))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel_response.status(), StatusCode::NO_CONTENT);

        let get_response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/projects/{}", created.id))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(get_response.into_body(), usize::MAX).await.unwrap();
        let reloaded: Project = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reloaded.status, coord_types::ProjectStatus::Failed);
    }
}
