use std::sync::Arc;

use axum::Router;
use kvindex_api::app;
use kvindex_common::config::IndexerConfig;
use kvindex_core::Indexer;

#[tokio::test]
async fn healthz_metrics_and_score_round_trip() {
    let indexer = Arc::new(Indexer::new(IndexerConfig::default()).unwrap());
    let app: Router = app(indexer.clone());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();

    let r = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{}/readyz", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{}/metrics", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let body = serde_json::json!({"prompt": "hello world", "model": "m"});
    let r = client.post(format!("{}/score", base)).json(&body).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{}/admin/stats", base)).send().await.unwrap();
    assert!(r.status().is_success());

    drop(srv);
}
