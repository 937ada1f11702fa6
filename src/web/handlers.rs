//! HTTP request handlers.

use super::AppState;
use crate::queue::{QueueCounts, QueueError, QueueName};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

fn parse_queue(name: &str) -> Result<QueueName, (StatusCode, String)> {
    name.parse().map_err(|e: String| (StatusCode::NOT_FOUND, e))
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.store.list_services() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "database": e.to_string() })),
        )
            .into_response();
    }
    if let Err(e) = state.queue.counts(QueueName::StatusCheck).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "queue": e.to_string() })),
        )
            .into_response();
    }
    Json(json!({ "status": "ok" })).into_response()
}

// ============================================================================
// Services and incidents
// ============================================================================

pub async fn handle_get_services(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_services() {
        Ok(services) => Json(services).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_incidents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.store.list_incidents(query.limit() as i64) {
        Ok(incidents) => Json(incidents).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Queues
// ============================================================================

#[derive(Debug, Serialize)]
pub struct QueuesResponse {
    pub queues: BTreeMap<&'static str, QueueCounts>,
}

pub async fn handle_get_queues(State(state): State<AppState>) -> impl IntoResponse {
    let mut queues = BTreeMap::new();
    for queue in QueueName::ALL {
        match state.queue.counts(queue).await {
            Ok(counts) => {
                queues.insert(queue.as_str(), counts);
            }
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
    Json(QueuesResponse { queues }).into_response()
}

pub async fn handle_get_failed(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let queue = match parse_queue(&queue) {
        Ok(q) => q,
        Err(rejection) => return rejection.into_response(),
    };

    match state.queue.failed(queue, query.limit()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_retry_failed(
    State(state): State<AppState>,
    Path((queue, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let queue = match parse_queue(&queue) {
        Ok(q) => q,
        Err(rejection) => return rejection.into_response(),
    };

    match state.queue.retry_failed(queue, &id).await {
        Ok(()) => {
            tracing::info!("Operator API: re-queued failed job {} on {}", id, queue);
            StatusCode::ACCEPTED.into_response()
        }
        Err(QueueError::NotFound(_)) => (StatusCode::NOT_FOUND, "Job not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::*;
    use crate::db::{Service, Store};
    use crate::queue::{JobOptions, JobQueue, MemoryQueue};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::Router;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Store>, Arc<MemoryQueue>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let state = AppState {
            store: store.clone(),
            queue: queue.clone(),
        };
        (router(state), store, queue)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    async fn failed_job(queue: &MemoryQueue) -> String {
        let opts = JobOptions {
            attempts: 1,
            ..JobOptions::default()
        };
        queue
            .add(QueueName::EmailNotification, "incident_created", json!({}), opts)
            .await
            .unwrap();
        let job = queue
            .claim(QueueName::EmailNotification, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        queue.fail(&job, "provider returned 502", false).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let (status, body) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_services() {
        let (app, store, _) = app();
        let mut service = Service {
            name: "API".to_string(),
            slug: "api".to_string(),
            ..Default::default()
        };
        store.add_service(&mut service).unwrap();

        let (status, body) = get_json(app, "/api/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["slug"], "api");
    }

    #[tokio::test]
    async fn test_queue_counts_and_failed_jobs() {
        let (app, _, queue) = app();
        let id = failed_job(&queue).await;

        let (status, body) = get_json(app.clone(), "/api/queues").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queues"].as_object().unwrap().len(), 5);
        assert_eq!(body["queues"]["email-notification"]["failed"], 1);

        let (status, body) = get_json(app, "/api/queues/email-notification/failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], id.as_str());
        assert_eq!(body[0]["failed_reason"], "provider returned 502");
    }

    #[tokio::test]
    async fn test_retry_failed_job() {
        let (app, _, queue) = app();
        let id = failed_job(&queue).await;

        let uri = format!("/api/queues/email-notification/failed/{}/retry", id);
        let response = app
            .clone()
            .oneshot(Request::post(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let counts = queue.counts(QueueName::EmailNotification).await.unwrap();
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.waiting, 1);

        let response = app
            .oneshot(Request::post(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let (app, _, _) = app();
        let (status, _) = get_json(app, "/api/queues/nope/failed").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
