//! Auto-seeding through the admin API, followed by a content update picked
//! up by the reconciler.

mod common;

use std::time::Duration;

use common::*;
use hyper::StatusCode;

async fn wait_for_record(node: &TestNode, name: &str) {
    for _ in 0..50 {
        if node.node.cache().durable().latest(name).await.unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} was never persisted", name);
}

#[tokio::test]
async fn test_enable_seeding_then_follow_update() {
    let gateway = spawn_gateway().await;
    let node = start_node(gateway).await;
    let v1 = cid_for(b"site v1");
    let v2 = cid_for(b"site v2");
    node.resolver.set("app.eth", Ok(v1));

    // Seeding requires a cached resolution, so visit first
    let rejected = https_request(
        &node,
        "POST",
        "node.localhost",
        "/api/toggle-auto-seed?domain=app.eth&enable=true",
        "",
    )
    .await;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);

    https_request(&node, "GET", "app.eth.localhost", "/", "").await;
    wait_for_record(&node, "app.eth").await;

    let enabled = https_request(
        &node,
        "POST",
        "node.localhost",
        "/api/toggle-auto-seed?domain=app.eth&enable=true",
        "",
    )
    .await;
    assert_eq!(enabled.status, StatusCode::OK);
    assert_eq!(*node.store.pins.lock().unwrap(), vec![v1]);

    node.resolver.set("app.eth", Ok(v2));
    // The background pass may already be running; wait for it to finish
    let report = loop {
        if let Some(report) = node.node.seeder().run_cycle().await {
            break report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(report.checked, 1);

    let record = node
        .node
        .cache()
        .durable()
        .latest("app.eth")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.cid, v2);
    assert!(record.auto_seed);
    assert_eq!(*node.store.pins.lock().unwrap(), vec![v1, v2]);

    let listed = https_request(&node, "GET", "node.localhost", "/api/cached-domains", "").await;
    let body: serde_json::Value = serde_json::from_slice(&listed.body).unwrap();
    assert_eq!(body["data"][0]["domain"], "app.eth");
    assert_eq!(body["data"][0]["autoSeed"], true);
}
