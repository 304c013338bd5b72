//! Router-level tests driven with `tower::ServiceExt::oneshot`.

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use upload_depot::{
    config::UploadSettings, db, routes::routes::routes, services::upload_service::UploadService,
};
use uuid::Uuid;

async fn app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let settings = UploadSettings {
        auto_complete: false,
        ..UploadSettings::rooted_at(dir.path())
    };
    let db = Arc::new(db::memory_pool().await.unwrap());
    let service = UploadService::new(db, settings);
    (dir, routes().with_state(service))
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn put_chunk(id: &str, index: u32, data: &'static [u8]) -> Request<Body> {
    Request::put(format!("/uploads/{id}/chunks/{index}"))
        .header(header::CONTENT_LENGTH, data.len())
        .body(Body::from(data))
        .unwrap()
}

#[tokio::test]
async fn health_endpoints() {
    let (_dir, app) = app().await;

    let live = send(&app, Request::get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(live.status(), StatusCode::OK);

    let ready = send(&app, Request::get("/readyz").body(Body::empty()).unwrap()).await;
    assert_eq!(ready.status(), StatusCode::OK);
    let body = json_body(ready).await;
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["disk"]["ok"], true);
}

#[tokio::test]
async fn chunked_upload_over_http() {
    let (_dir, app) = app().await;

    let init = Request::post("/uploads")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-uploader", "henry")
        .body(Body::from(
            json!({
                "originalFilename": "notes.txt",
                "mimeType": "text/plain",
                "context": "public",
                "totalSize": 10,
                "chunkSize": 4
            })
            .to_string(),
        ))
        .unwrap();
    let response = send(&app, init).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let descriptor = json_body(response).await;
    assert_eq!(descriptor["totalChunks"], 3);
    let id = descriptor["sessionId"].as_str().unwrap().to_string();

    for (index, data) in [(2u32, &b"ij"[..]), (0, &b"abcd"[..]), (1, &b"efgh"[..])] {
        let response = send(&app, put_chunk(&id, index, data)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let missing_length = Request::put(format!("/uploads/{id}/chunks/0"))
        .body(Body::from("abcd"))
        .unwrap();
    assert_eq!(
        send(&app, missing_length).await.status(),
        StatusCode::LENGTH_REQUIRED
    );

    let out_of_range = send(&app, put_chunk(&id, 9, b"zz")).await;
    assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);

    let status = send(
        &app,
        Request::get(format!("/uploads/{id}")).body(Body::empty()).unwrap(),
    )
    .await;
    let status = json_body(status).await;
    assert_eq!(status["missingChunks"], json!([]));

    let complete = send(
        &app,
        Request::post(format!("/uploads/{id}/complete"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(complete.status(), StatusCode::OK);
    let record = json_body(complete).await;
    assert_eq!(record["uploader"], "henry");
    assert_eq!(record["is_public"], true);
    assert_eq!(record["file_size"], 10);
    let file_id = record["id"].as_str().unwrap().to_string();

    let late = send(&app, put_chunk(&id, 0, b"abcd")).await;
    assert_eq!(late.status(), StatusCode::CONFLICT);

    let download = send(
        &app,
        Request::get(format!("/files/{file_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(download.status(), StatusCode::OK);
    let etag = download.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{}\"", record["content_hash"].as_str().unwrap()));
    let bytes = to_bytes(download.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"abcdefghij");
}

#[tokio::test]
async fn whole_file_lifecycle() {
    let (_dir, app) = app().await;

    let upload = Request::post("/files?filename=photo.jpg&context=album")
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header("x-meta-camera", "x100")
        .body(Body::from("not really a jpeg"))
        .unwrap();
    let response = send(&app, upload).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let record = json_body(response).await;
    assert_eq!(record["upload_source"], "direct");
    assert_eq!(record["uploader"], "anonymous");
    assert_eq!(record["metadata"]["camera"], "x100");
    assert_eq!(record["is_public"], false);
    let id = record["id"].as_str().unwrap().to_string();

    let listing = send(
        &app,
        Request::get("/files?context=album&limit=10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let listing = json_body(listing).await;
    assert_eq!(listing["files"].as_array().unwrap().len(), 1);
    assert!(listing.get("nextCursor").is_none());

    let deleted = send(
        &app,
        Request::delete(format!("/files/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let meta = send(
        &app,
        Request::get(format!("/files/{id}/meta"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(meta.status(), StatusCode::NOT_FOUND);
    let error = json_body(meta).await;
    assert_eq!(error["status"], 404);
}

#[tokio::test]
async fn unknown_session_and_empty_file() {
    let (_dir, app) = app().await;

    let cancel = send(
        &app,
        Request::delete(format!("/uploads/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(cancel.status(), StatusCode::NOT_FOUND);

    let empty = send(
        &app,
        Request::post("/files?filename=empty.txt&context=docs")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}
