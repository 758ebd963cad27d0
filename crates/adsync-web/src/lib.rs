//! Axum JSON API over the sync service.

use std::sync::Arc;

use adsync_core::{JobSpec, RemoveOutcome, SyncError};
use adsync_sync::SyncService;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adsync-web";

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
}

impl AppState {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FailedQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackfillRequest {
    pub brand_id: Uuid,
    pub connection_id: Uuid,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .route("/queue/failed", get(queue_failed_handler))
        .route("/jobs", post(enqueue_handler))
        .route("/jobs/{id}", get(job_handler).delete(remove_job_handler))
        .route("/jobs/{id}/requeue", post(requeue_handler))
        .route("/connections/{id}/progress", get(progress_handler))
        .route("/backfill", post(backfill_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: SyncService) -> anyhow::Result<()> {
    let port = service.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving JSON API");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(adsync_sync::build_service_from_env().await?).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn queue_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.get_queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn queue_failed_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.service.list_failed(limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn enqueue_handler(State(state): State<Arc<AppState>>, Json(spec): Json<JobSpec>) -> Response {
    match state.service.enqueue(&spec).await {
        Ok(job_id) => (StatusCode::CREATED, Json(json!({ "job_id": job_id }))).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn job_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.service.get_job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => sync_error(SyncError::NotFound(format!("job {id}"))),
        Err(err) => sync_error(err),
    }
}

async fn remove_job_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.service.remove_job(id).await {
        Ok(RemoveOutcome::NotFound) => sync_error(SyncError::NotFound(format!("job {id}"))),
        Ok(outcome @ RemoveOutcome::NotRemovable(_)) => {
            (StatusCode::CONFLICT, Json(outcome)).into_response()
        }
        Ok(RemoveOutcome::CancellationRequested) => {
            (StatusCode::ACCEPTED, Json(RemoveOutcome::CancellationRequested)).into_response()
        }
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn requeue_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.service.requeue_failed(id).await {
        Ok(true) => Json(json!({ "requeued": true })).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({ "requeued": false, "error": format!("job {id} is not in the failed set") })),
        )
            .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn progress_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.service.get_connection_progress(id).await {
        Ok(progress) => Json(progress).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn backfill_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BackfillRequest>,
) -> Response {
    match state
        .service
        .trigger_backfill(req.brand_id, req.connection_id, req.start_date)
        .await
    {
        Ok(plan) => (StatusCode::ACCEPTED, Json(plan)).into_response(),
        Err(err) => sync_error(err),
    }
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::Auth(_) => StatusCode::UNAUTHORIZED,
        SyncError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        SyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SyncError::TransientNetwork(_) | SyncError::Storage(_) | SyncError::PermanentFailure(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn sync_error(err: SyncError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_adapters::FixtureAdsApi;
    use adsync_core::{
        ConnectionMetadata, ConnectionStatus, JobKind, PlatformConnection, SyncStatus, TimeRange,
    };
    use adsync_storage::{ConnectionStore, MemoryStore, Stores};
    use adsync_sync::{SyncConfig, SyncSettings, TracingNotifier};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        service: SyncService,
    }

    fn test_app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let service = SyncService::new(
            SyncConfig::from_env(),
            SyncSettings::default(),
            Stores::from_backend(store.clone()),
            Arc::new(FixtureAdsApi::new()),
            Arc::new(TracingNotifier),
        );
        TestApp {
            router: app(AppState::new(service.clone())),
            store,
            service,
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn refresh_spec() -> serde_json::Value {
        json!({
            "kind": "daily_refresh",
            "brand_id": Uuid::new_v4(),
            "connection_id": Uuid::new_v4(),
            "time_range": { "since": "2024-05-01", "until": "2024-05-04" },
            "priority": "high"
        })
    }

    #[tokio::test]
    async fn health_and_empty_stats() {
        let t = test_app();
        let (status, body) = send(&t.router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&t.router, get("/queue/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["waiting"], 0);
    }

    #[tokio::test]
    async fn enqueue_then_remove_job() {
        let t = test_app();
        let (status, body) = send(&t.router, post_json("/jobs", refresh_spec())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["job_id"].as_str().unwrap().to_string();

        let (status, body) = send(&t.router, get(&format!("/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priority"], "high");

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/jobs/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&t.router, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "removed");

        let (status, _) = send(&t.router, get(&format!("/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_spec_is_unprocessable() {
        let t = test_app();
        let mut spec = refresh_spec();
        spec["time_range"] = json!({ "since": "2024-05-04", "until": "2024-05-01" });
        let (status, body) = send(&t.router, post_json("/jobs", spec)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("validation"));
    }

    #[tokio::test]
    async fn unknown_progress_is_not_found() {
        let t = test_app();
        let (status, _) = send(&t.router, get(&format!("/connections/{}/progress", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn backfill_queues_plan_and_reports_progress() {
        let t = test_app();
        let connection = PlatformConnection {
            id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            platform: "meta".into(),
            access_token: "token".into(),
            status: ConnectionStatus::Active,
            sync_status: SyncStatus::Idle,
            metadata: ConnectionMetadata {
                ad_account_id: "act_3".into(),
                extra: Default::default(),
            },
            created_at: Utc::now(),
        };
        t.store.upsert_connection(&connection).await.unwrap();

        let start = Utc::now().date_naive() - chrono::Days::new(40);
        let (status, plan) = send(
            &t.router,
            post_json(
                "/backfill",
                json!({
                    "brand_id": connection.brand_id,
                    "connection_id": connection.id,
                    "start_date": start,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(plan["days_target"], 41);
        assert!(!plan["metric_jobs"].as_array().unwrap().is_empty());

        let (status, progress) =
            send(&t.router, get(&format!("/connections/{}/progress", connection.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["stage"], "queued");
        assert_eq!(progress["percent"], 0.0);

        let (status, _) = send(
            &t.router,
            post_json(
                "/backfill",
                json!({ "brand_id": connection.brand_id, "connection_id": Uuid::new_v4() }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_jobs_can_be_listed_and_requeued() {
        let t = test_app();
        let spec = JobSpec::daily_refresh(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TimeRange::single_day(Utc::now().date_naive()),
        );
        let id = t.service.enqueue(&spec).await.unwrap();
        let job = t.service.queue().dequeue(1, "test").await.unwrap().remove(0);
        t.service
            .queue()
            .fail(&job, &SyncError::PermanentFailure("boom".into()))
            .await
            .unwrap();

        let (status, failed) = send(&t.router, get("/queue/failed?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(failed.as_array().unwrap().len(), 1);
        assert_eq!(failed[0]["task"]["kind"], JobKind::DailyRefresh.as_str());

        let (status, _) = send(&t.router, post_json(&format!("/jobs/{id}/requeue"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&t.router, post_json(&format!("/jobs/{id}/requeue"), json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
