mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use common::*;
use http_body_util::BodyExt;
use imgu_sync::api::{self, AppState};
use imgu_sync::control::SyncController;
use imgu_sync::db::{self, ControlPatch};
use imgu_sync::model::{ImageRecord, SyncStatus};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app(pool: &db::Pool, engine: &FakeEngine) -> Router {
    let controller = SyncController::new(pool.clone(), Arc::new(engine.clone()), SYNC.into(), 30, 60);
    api::router(
        AppState {
            pool: pool.clone(),
            controller: Arc::new(controller),
        },
        "*",
    )
}

async fn call(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn seed_images(pool: &db::Pool, ids: &[&str]) {
    for id in ids {
        db::put_image(
            pool,
            &ImageRecord {
                photo_id: id.to_string(),
                category: "nature".into(),
                object_key: format!("nature/{id}.jpg"),
                public_url: format!("https://cdn.example/nature/{id}.jpg"),
                byte_size: 10,
                content_type: "image/jpeg".into(),
                synced_at: Utc::now(),
                payload: json!({ "id": id }),
            },
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn status_of_fresh_deployment_is_idle() {
    let pool = setup_pool().await;
    let app = app(&pool, &FakeEngine::default()).await;

    let (status, body) = call(&app, "GET", "/sync-status", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "IDLE");
    assert_eq!(body["syncType"], SYNC);
    assert_eq!(body["stale"], false);
}

#[tokio::test]
async fn start_is_accepted_once() {
    let pool = setup_pool().await;
    let engine = FakeEngine::default();
    let app = app(&pool, &engine).await;

    let (status, body) = call(&app, "POST", "/start-sync", Body::empty()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["resumedFromPage"], 1);
    let arn = body["executionArn"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "POST", "/start-sync", Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["executionArn"], arn.as_str());

    let (status, body) = call(&app, "GET", "/sync-status", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "RUNNING");
    assert_eq!(body["executionArn"], arn.as_str());
}

#[tokio::test]
async fn stop_routes_map_outcomes_to_status_codes() {
    let pool = setup_pool().await;
    let engine = FakeEngine::default();
    let app = app(&pool, &engine).await;

    let (status, _) = call(&app, "POST", "/stop-sync", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/stop-sync", Body::from("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "POST",
        "/stop-sync",
        Body::from(r#"{"executionArn":"gone"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["executionArn"], "gone");

    call(&app, "POST", "/start-sync", Body::empty()).await;
    let (status, body) = call(&app, "POST", "/stop-sync", Body::from("{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(engine.stopped().await, vec![body["executionArn"].as_str().unwrap().to_string()]);
    let rec = db::get_sync_control(&pool, SYNC).await.unwrap().unwrap();
    assert_eq!(rec.last_known_status, SyncStatus::Stopping);
}

#[tokio::test]
async fn stop_while_launching_asks_caller_to_retry() {
    let pool = setup_pool().await;
    let engine = FakeEngine::default();
    let app = app(&pool, &engine).await;
    let marker = db::claim_for_start(&pool, SYNC).await.unwrap().unwrap();

    let (status, body) = call(&app, "POST", "/stop-sync", Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("launching"));
    assert!(engine.stopped().await.is_empty());

    let rec = db::get_sync_control(&pool, SYNC).await.unwrap().unwrap();
    assert_eq!(rec.last_known_status, SyncStatus::Running);
    assert_eq!(rec.current_execution_arn, Some(marker));
}

#[tokio::test]
async fn listing_pages_with_next_token() {
    let pool = setup_pool().await;
    seed_images(&pool, &["c", "a", "b"]).await;
    let app = app(&pool, &FakeEngine::default()).await;

    let (status, body) = call(&app, "GET", "/?limit=2", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<_> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["photoId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
    let token = body["nextToken"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "GET", &format!("/?limit=2&nextToken={token}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["photoId"], "c");
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert!(body["nextToken"].is_null());
}

#[tokio::test]
async fn listing_rejects_garbage_token() {
    let pool = setup_pool().await;
    let app = app(&pool, &FakeEngine::default()).await;

    let (status, body) = call(&app, "GET", "/?nextToken=%21%21%21", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid nextToken");
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let pool = setup_pool().await;
    let app = app(&pool, &FakeEngine::default()).await;

    let (status, body) = call(&app, "GET", "/nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "message": "Not Found" }));
}

#[tokio::test]
async fn summary_reports_totals() {
    let pool = setup_pool().await;
    seed_images(&pool, &["a", "b"]).await;
    db::update_sync_control(&pool, SYNC, &ControlPatch::status(SyncStatus::Succeeded, None))
        .await
        .unwrap();
    let app = app(&pool, &FakeEngine::default()).await;

    let (status, body) = call(&app, "GET", "/summary", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overallItemCount"], 2);
    assert_eq!(body["overallStorageBytes"], 20);
    assert_eq!(body["overallStorageHuman"], "20 Bytes");
    assert_eq!(body["lastKnownStatus"], "SUCCEEDED");
    assert!(body["estimatedApiReset"].is_null());
}
