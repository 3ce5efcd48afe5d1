use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::State,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::engine::Phase;
use crate::metrics;
use crate::router::MessageRouter;

#[derive(Clone)]
pub struct AppState {
    router: MessageRouter,
}

impl AppState {
    pub fn new(router: MessageRouter) -> Self {
        Self { router }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    phase: Phase,
    backend_available: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.router.engine();
    engine.ready().await;
    Json(HealthResponse {
        status: "ok",
        phase: engine.phase(),
        backend_available: engine.backend_available(),
    })
}

async fn message(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    Json(state.router.handle_json(body).await)
}

async fn notices(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.router.engine().subscribe_notices();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(notice) => {
            let data = serde_json::to_string(&notice).unwrap_or_else(|_| "{}".into());
            Some(Ok(Event::default().event(notice.event_name()).data(data)))
        }
        // Lagged subscribers skip what they missed.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/message", post(message))
        .route("/notices", get(notices))
        .with_state(state)
}
