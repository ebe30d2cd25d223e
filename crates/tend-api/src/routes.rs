use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Serialize;
use tend_core::replication::DEFAULT_BATCH_SIZE;
use tend_core::{Checkpoint, PullBatch, PushRow, Replica, Todo};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    replica: Replica,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, replica: Replica) -> Self {
        Self { config, replica }
    }
}

pub fn app_router(state: AppState) -> Router {
    let replication_routes = Router::new()
        .route("/pull", get(pull))
        .route("/push", post(push))
        .route("/pullStream", get(pull_stream));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/todos", replication_routes.clone())
        .merge(replication_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    documents: usize,
    subscribers: usize,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        documents: state.replica.count().await?,
        subscribers: state.replica.subscriber_count(),
    }))
}

/// Checkpoint and batch size from the query string. Missing or unparsable
/// values fall back to the zero checkpoint and the default batch size.
fn pull_params(params: &HashMap<String, String>, max_batch_size: usize) -> (Checkpoint, usize) {
    let updated_at = params
        .get("updatedAt")
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let id = params.get("id").cloned().unwrap_or_default();
    let batch_size = params
        .get("batchSize")
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_BATCH_SIZE)
        .min(max_batch_size);
    (Checkpoint::new(updated_at, id), batch_size)
}

async fn pull(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PullBatch>, AppError> {
    let (checkpoint, batch_size) = pull_params(&params, state.config.max_batch_size);
    let batch = state.replica.pull(&checkpoint, batch_size).await?;
    Ok(Json(batch))
}

async fn push(State(state): State<AppState>, body: Bytes) -> Result<Json<Vec<Todo>>, AppError> {
    let rows = parse_push_body(&body)?;
    let conflicts = state.replica.push(&rows).await?;
    if !conflicts.is_empty() {
        tracing::info!(conflicts = conflicts.len(), "Push reported conflicts");
    }
    Ok(Json(conflicts))
}

fn parse_push_body(body: &[u8]) -> Result<Vec<PushRow>, AppError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("Invalid JSON body: {e}")))?;
    let serde_json::Value::Array(items) = value else {
        return Err(AppError::bad_request("Expected array of changes"));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item)
                .map_err(|e| AppError::bad_request(format!("Invalid change at index {index}: {e}")))
        })
        .collect()
}

async fn pull_stream(State(state): State<AppState>) -> Response {
    let sse = Sse::new(event_stream(state.replica.subscribe()));
    let headers = [
        (header::CONNECTION, "keep-alive"),
        (header::CACHE_CONTROL, "no-cache"),
    ];
    tracing::debug!(
        subscribers = state.replica.subscriber_count(),
        "Opened pull stream"
    );

    match state.config.sse_keep_alive {
        Some(interval) => (headers, sse.keep_alive(KeepAlive::new().interval(interval)))
            .into_response(),
        None => (headers, sse).into_response(),
    }
}

/// Frames for one subscriber. Ends after the resync marker, or when the
/// replica shuts down; the subscription is released when the client goes away.
fn event_stream(
    subscription: tend_core::replication::Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        loop {
            let item = subscription.recv().await?;
            match item.to_json() {
                Ok(data) => return Some((Ok(Event::default().data(data)), subscription)),
                Err(e) => tracing::warn!(error = %e, "Dropping unencodable stream item"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tend_core::{HttpMaster, PullStreamItem, ReplicationConfig, ReplicationState, TodoState};
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        let config = AppConfig {
            max_batch_size: 2,
            ..AppConfig::default()
        };
        AppState::new(Arc::new(config), Replica::in_memory())
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn pull_params_fall_back_and_clamp() {
        let params = HashMap::from([
            ("updatedAt".to_string(), "soon".to_string()),
            ("id".to_string(), "t1".to_string()),
            ("batchSize".to_string(), "5000".to_string()),
        ]);
        let (checkpoint, batch_size) = pull_params(&params, 1_000);
        assert_eq!(checkpoint, Checkpoint::new(0, "t1"));
        assert_eq!(batch_size, 1_000);

        let (checkpoint, batch_size) = pull_params(&HashMap::new(), 1_000);
        assert_eq!(checkpoint, Checkpoint::zero());
        assert_eq!(batch_size, DEFAULT_BATCH_SIZE);
    }

    #[tokio::test]
    async fn push_then_pull_from_zero_returns_the_write() {
        let router = app_router(test_state());
        let body = json!([{
            "newDocumentState": {"id": "t1", "name": "buy milk", "state": "open", "lastChange": 100},
            "assumedMasterState": null
        }]);

        let (status, conflicts) = send(router.clone(), post_json("/push", &body.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(conflicts, json!([]));

        let (status, batch) = send(router, get("/pull?updatedAt=0&id=&batchSize=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["documents"][0]["id"], "t1");
        assert_eq!(batch["checkpoint"], json!({"id": "t1", "updatedAt": 100}));
    }

    #[tokio::test]
    async fn second_push_with_same_base_conflicts() {
        let state = test_state();
        let router = app_router(state.clone());
        let base = json!({"id": "t1", "name": "a", "state": "open", "lastChange": 100});
        send(
            router.clone(),
            post_json("/push", &json!([{"newDocumentState": base}]).to_string()),
        )
        .await;

        let first = json!([{
            "newDocumentState": {"id": "t1", "name": "b", "state": "open", "lastChange": 200},
            "assumedMasterState": base
        }]);
        let second = json!([{
            "newDocumentState": {"id": "t1", "name": "c", "state": "open", "lastChange": 300},
            "assumedMasterState": base
        }]);
        let (_, conflicts) = send(router.clone(), post_json("/todos/push", &first.to_string())).await;
        assert_eq!(conflicts, json!([]));
        let (status, conflicts) = send(router, post_json("/todos/push", &second.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(conflicts[0]["name"], "b");
        assert_eq!(
            state.replica.get(&"t1".into()).await.unwrap().unwrap().name,
            "b"
        );
    }

    #[tokio::test]
    async fn malformed_push_bodies_are_client_errors() {
        let router = app_router(test_state());

        let (status, body) = send(router.clone(), post_json("/push", r#"{"id": "t1"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Expected array of changes");

        let (status, _) = send(router.clone(), post_json("/push", r#"[{"nope": 1}]"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(router, post_json("/push", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pull_batches_are_clamped_to_the_configured_maximum() {
        let state = test_state();
        for name in ["a", "b", "c"] {
            state.replica.insert(name).await.unwrap();
        }
        let (status, batch) = send(app_router(state), get("/pull?batchSize=50")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["documents"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn healthz_reports_documents() {
        let state = test_state();
        state.replica.insert("one").await.unwrap();
        let (status, body) = send(app_router(state), get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["documents"], 1);
        assert_eq!(body["subscribers"], 0);
    }

    #[tokio::test]
    async fn pull_stream_carries_event_frames() {
        let state = test_state();
        let response = app_router(state.clone())
            .oneshot(get("/pullStream"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let todo = state.replica.insert("streamed").await.unwrap();
        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let frame = String::from_utf8(chunk.to_vec()).unwrap();
        let data = frame
            .trim_end()
            .strip_prefix("data: ")
            .expect("data frame");
        let PullStreamItem::Event(event) = PullStreamItem::from_json(data).unwrap() else {
            panic!("expected event, got {data}");
        };
        assert_eq!(event.documents, vec![todo]);
    }

    #[tokio::test]
    async fn http_clients_converge_through_the_server() {
        let state = test_state();
        let server = state.replica.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app_router(state)).await.unwrap();
        });

        let config = ReplicationConfig {
            retry_interval_ms: 50,
            ..ReplicationConfig::default()
        };
        let alice = Replica::in_memory();
        let bob = Replica::in_memory();
        let alice_sync = ReplicationState::start(
            alice.clone(),
            HttpMaster::new(&base_url).unwrap(),
            config.clone(),
        )
        .unwrap();
        let bob_sync =
            ReplicationState::start(bob.clone(), HttpMaster::new(&base_url).unwrap(), config)
                .unwrap();
        alice_sync.await_in_sync().await.unwrap();
        bob_sync.await_in_sync().await.unwrap();

        let todo = alice.insert("walk dog").await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while bob.get(&todo.id).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("bob never saw alice's todo");

        bob.toggle(&todo.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let seen = alice.get(&todo.id).await.unwrap().map(|t| t.state);
                if seen == Some(TodoState::Done) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("alice never saw bob's toggle");
        assert_eq!(server.count().await.unwrap(), 1);

        alice_sync.cancel().await;
        bob_sync.cancel().await;
    }
}
