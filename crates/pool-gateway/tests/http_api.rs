//! End-to-end gateway tests: real HTTP against the router bound to an
//! ephemeral port, backed by a pool of scripted recognizers.

use std::future::IntoFuture as _;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Value, json};

use hony_pool_core::PoolConfig;
use hony_pool_engine::testing::{Script, ScriptedFactory};
use hony_pool_engine::{PoolHandle, PoolOptions, start_pool};

struct TestServer {
    base: String,
    pool: PoolHandle,
    client: reqwest::Client,
}

async fn serve(cfg: PoolConfig, script: Script) -> TestServer {
    let factory = Arc::new(ScriptedFactory::new(script));
    let pool = start_pool(PoolOptions::new(cfg, factory))
        .await
        .expect("pool starts");

    let app = hony_pool_gateway::router(pool.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());

    TestServer {
        base: format!("http://{addr}"),
        pool,
        client: reqwest::Client::new(),
    }
}

fn small_config() -> PoolConfig {
    let mut cfg = PoolConfig::default();
    cfg.min_instances = 1;
    cfg.max_instances = 1;
    cfg.max_workers = 1;
    cfg.scaling.queue_up_threshold = 10_000;
    cfg.scaling.latency_up_threshold_sec = 10_000.0;
    cfg.scaling.idle_down_threshold = 1.0;
    cfg
}

fn text_png_b64() -> String {
    let mut img = image::GrayImage::from_pixel(64, 32, image::Luma([255]));
    for x in 10..30 {
        img.put_pixel(x, 15, image::Luma([0]));
    }
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    B64.encode(out.into_inner())
}

#[tokio::test]
async fn health_reports_the_service() {
    let server = serve(small_config(), Script::with_lines(&["hi"])).await;

    let body: Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["service"], "ocr-pool");
    assert!(body["timestamp"].is_string());

    server.pool.shutdown().await;
}

#[tokio::test]
async fn single_recognize_returns_keyword_matches() {
    let server = serve(small_config(), Script::with_lines(&["7 apples"])).await;

    let response = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": text_png_b64(), "keywords": ["apples"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert!(body["processing_time"].as_f64().unwrap() > 0.0);

    let matches = body["data"]["keyword_matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["keyword"], "apples");

    let regions = body["data"]["processed_result"].as_array().unwrap();
    assert!(
        regions
            .iter()
            .any(|r| r["text"].as_str().unwrap().contains("apples"))
    );
    // bbox serializes as a flat [x1, y1, x2, y2] array of numbers.
    assert_eq!(matches[0]["bbox"].as_array().unwrap().len(), 4);

    server.pool.shutdown().await;
}

#[tokio::test]
async fn recognition_of_empty_content_is_still_http_200() {
    let server = serve(small_config(), Script::with_lines(&["never"])).await;

    let white = {
        let img = image::GrayImage::from_pixel(64, 32, image::Luma([255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        B64.encode(out.into_inner())
    };

    let response = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": white }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["processed_result"].as_array().unwrap().len(), 0);
    assert_eq!(body["data"]["keyword_matches"].as_array().unwrap().len(), 0);

    server.pool.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_are_400() {
    let server = serve(small_config(), Script::with_lines(&["x"])).await;

    // Missing image.
    let response = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "keywords": ["x"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");

    // Undecodable base64.
    let response = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": "!!!not-base64!!!" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Valid base64, not an image.
    let response = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": B64.encode(b"plain text") }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unknown request type.
    let response = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": text_png_b64(), "request_type": "transcribe" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.pool.shutdown().await;
}

#[tokio::test]
async fn saturated_queue_returns_409() {
    let mut cfg = small_config();
    cfg.max_queue_size = 2;
    let mut script = Script::with_lines(&["slow"]);
    script.delay = Duration::from_millis(1000);
    let server = serve(cfg, script).await;

    let post = |client: reqwest::Client, base: String| async move {
        client
            .post(format!("{base}/ocr"))
            .json(&json!({ "image": text_png_b64() }))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16()
    };

    // Occupy the single worker, then fill the two queue slots.
    let first = tokio::spawn(post(server.client.clone(), server.base.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = tokio::spawn(post(server.client.clone(), server.base.clone()));
    let third = tokio::spawn(post(server.client.clone(), server.base.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let denied = server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": text_png_b64() }))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 409);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["status"], "error");

    assert_eq!(first.await.unwrap(), 200);
    assert_eq!(second.await.unwrap(), 200);
    assert_eq!(third.await.unwrap(), 200);

    server.pool.shutdown().await;
}

#[tokio::test]
async fn status_exposes_pool_statistics() {
    let server = serve(small_config(), Script::with_lines(&["x"])).await;

    server
        .client
        .post(format!("{}/ocr", server.base))
        .json(&json!({ "image": text_png_b64() }))
        .send()
        .await
        .unwrap();

    let body: Value = server
        .client
        .get(format!("{}/status", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["total_instances"], 1);
    assert_eq!(body["data"]["total_requests"], 1);
    assert_eq!(body["data"]["successful_requests"], 1);
    assert!(body["data"]["queue_depths"]["normal"].is_number());

    server.pool.shutdown().await;
}

#[tokio::test]
async fn instance_views_and_unknown_ids() {
    let server = serve(small_config(), Script::with_lines(&["x"])).await;

    let body: Value = server
        .client
        .get(format!("{}/instances", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let instances = body["data"].as_array().unwrap();
    assert_eq!(instances.len(), 1);
    let id = instances[0]["instance_id"].as_str().unwrap().to_string();
    assert!(instances[0]["port"].as_u64().unwrap() >= 8901);

    let detail: Value = server
        .client
        .get(format!("{}/instances/{id}", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["data"]["instance_id"], id.as_str());
    assert_eq!(detail["data"]["config"]["languages"][0], "en");
    assert!(detail["data"]["response_times"].is_array());

    let logs: Value = server
        .client
        .get(format!("{}/instances/{id}/logs", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!logs["data"].as_array().unwrap().is_empty());

    let missing = server
        .client
        .get(format!("{}/instances/no-such-instance", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    server.pool.shutdown().await;
}

#[tokio::test]
async fn instance_crud_respects_the_pool_bounds() {
    let mut cfg = small_config();
    cfg.max_instances = 2;
    let server = serve(cfg, Script::with_lines(&["x"])).await;

    // Create up to the bound.
    let created: Value = server
        .client
        .post(format!("{}/instances", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let new_id = created["data"]["instance_id"].as_str().unwrap().to_string();

    // At max: rejected with 500.
    let at_max = server
        .client
        .post(format!("{}/instances", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(at_max.status(), 500);

    let removed = server
        .client
        .delete(format!("{}/instances/{new_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), 200);

    let missing = server
        .client
        .delete(format!("{}/instances/{new_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    server.pool.shutdown().await;
}

#[tokio::test]
async fn stop_start_restart_cycle() {
    let server = serve(small_config(), Script::with_lines(&["x"])).await;
    let id = server.pool.instance_summaries()[0].instance_id.clone();

    let stop = server
        .client
        .post(format!("{}/instances/{id}/stop", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(stop.status(), 200);
    let detail: Value = server
        .client
        .get(format!("{}/instances/{id}", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["data"]["status"], "stopped");

    let start = server
        .client
        .post(format!("{}/instances/{id}/start", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), 200);

    // Starting a ready instance is rejected.
    let again = server
        .client
        .post(format!("{}/instances/{id}/start", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 500);

    let restart = server
        .client
        .post(format!("{}/instances/{id}/restart", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(restart.status(), 200);

    server.pool.shutdown().await;
}
