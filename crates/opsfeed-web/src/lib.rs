//! JSON consumer surface over the notification engine.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use opsfeed_core::{now_millis, Category};
use opsfeed_sync::{NotificationEngine, RefreshOutcome, ToastBoard};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "opsfeed-web";
pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NotificationEngine>,
    pub toasts: Arc<ToastBoard>,
}

impl AppState {
    pub fn new(engine: Arc<NotificationEngine>, toasts: Arc<ToastBoard>) -> Self {
        Self { engine, toasts }
    }
}

#[derive(Debug, Deserialize)]
struct VisibilityBody {
    visible: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/notifications", get(notifications_handler))
        .route("/notifications/fresh", get(fresh_handler))
        .route("/notifications/read-all", post(read_all_handler))
        .route("/notifications/{id}/read", post(read_handler))
        .route("/categories/{category}/seen", post(seen_handler))
        .route("/refresh", post(refresh_handler))
        .route("/visibility", post(visibility_handler))
        .route("/toasts", get(toasts_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("OPSFEED_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving notification feed");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn notifications_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.sorted_state().await).into_response()
}

async fn fresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let fresh: BTreeMap<Category, usize> = state.engine.fresh_counts().await.into_iter().collect();
    Json(fresh).into_response()
}

async fn read_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if !state.engine.mark_as_read(&id).await {
        return error_response(StatusCode::NOT_FOUND, format!("no notification with id {id}"));
    }
    Json(state.engine.state().await.counts).into_response()
}

async fn read_all_handler(State(state): State<Arc<AppState>>) -> Response {
    state.engine.mark_all_as_read().await;
    Json(state.engine.state().await.counts).into_response()
}

async fn seen_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
) -> Response {
    let category: Category = match category.parse() {
        Ok(category) => category,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    state.engine.mark_category_as_seen(category).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.engine.refresh_now().await;
    let status = match outcome {
        RefreshOutcome::Completed(_) => StatusCode::OK,
        RefreshOutcome::AlreadyInFlight => StatusCode::ACCEPTED,
        RefreshOutcome::Disposed => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(outcome)).into_response()
}

async fn visibility_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VisibilityBody>,
) -> Response {
    state.engine.set_visible(body.visible);
    StatusCode::NO_CONTENT.into_response()
}

async fn toasts_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.toasts.active(now_millis())).into_response()
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use opsfeed_adapters::{draft, SourceAdapter, StaticSource};
    use opsfeed_storage::MemoryKvStore;
    use opsfeed_sync::{EngineSettings, PushEvent, PushKind, Toast};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn state_with(batch: Vec<opsfeed_core::NotificationDraft>) -> AppState {
        let source = Arc::new(StaticSource::new("reviews", Category::Review).with_batch(batch));
        let engine = Arc::new(NotificationEngine::new(
            EngineSettings::default(),
            vec![source as Arc<dyn SourceAdapter>],
            Arc::new(MemoryKvStore::new()),
        ));
        engine.init().await;
        AppState::new(engine, Arc::new(ToastBoard::default()))
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn refresh_then_list_newest_first() {
        let state = state_with(vec![
            draft(Category::Review, "old", 10),
            draft(Category::Review, "new", 20),
        ])
        .await;
        let app = app(state);

        let refresh = app.clone().oneshot(post("/refresh")).await.unwrap();
        assert_eq!(refresh.status(), StatusCode::OK);
        let report = json_body(refresh).await;
        assert_eq!(report["outcome"], "completed");
        assert_eq!(report["created"], 2);

        let resp = app
            .oneshot(Request::builder().uri("/notifications").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let feed = json_body(resp).await;
        assert_eq!(feed["counts"]["review"], 2);
        assert_eq!(feed["items"][0]["sourceId"], "new");
        assert_eq!(feed["items"][0]["sourceType"], "review");
    }

    #[tokio::test]
    async fn mark_read_returns_counts_and_404s_unknown_ids() {
        let state = state_with(vec![draft(Category::Review, "r1", 5)]).await;
        state.engine.refresh_now().await;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post("/notifications/review-r1-5/read"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["review"], 0);

        let missing = app
            .clone()
            .oneshot(post("/notifications/review-nope-1/read"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let all = app.oneshot(post("/notifications/read-all")).await.unwrap();
        assert_eq!(all.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn seen_accepts_plural_categories_and_rejects_unknown() {
        let state = state_with(vec![draft(Category::Review, "r1", 5)]).await;
        state.engine.refresh_now().await;
        let engine = Arc::clone(&state.engine);
        let app = app(state);

        let fresh = app
            .clone()
            .oneshot(Request::builder().uri("/notifications/fresh").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(fresh).await["review"], 1);

        let seen = app.clone().oneshot(post("/categories/reviews/seen")).await.unwrap();
        assert_eq!(seen.status(), StatusCode::NO_CONTENT);
        assert_eq!(engine.fresh_counts().await[&Category::Review], 0);

        let bad = app.oneshot(post("/categories/invoices/seen")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn visibility_flag_reaches_the_engine() {
        let state = state_with(vec![]).await;
        let engine = Arc::clone(&state.engine);
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/visibility")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({"visible": false}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(!engine.is_visible());
    }

    #[tokio::test]
    async fn toasts_lists_active_toasts() {
        let state = state_with(vec![]).await;
        let event = PushEvent {
            kind: PushKind::NewOrder,
            data: json!({"id": "o1", "customerName": "Ada", "totalAmount": 12.5}),
        };
        state.toasts.push(Toast::for_event(&event, now_millis()));
        let resp = app(state)
            .oneshot(Request::builder().uri("/toasts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let toasts = json_body(resp).await;
        assert_eq!(toasts.as_array().unwrap().len(), 1);
        assert_eq!(toasts[0]["title"], "New order");
    }

    #[tokio::test]
    async fn disposed_engine_refuses_refresh() {
        let state = state_with(vec![]).await;
        state.engine.dispose();
        let resp = app(state).oneshot(post("/refresh")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["outcome"], "disposed");
    }
}
