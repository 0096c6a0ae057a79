//! HTTP surface tests against the in-memory service graph.

use std::sync::Arc;

use serde_json::{json, Value};
use tapstorm::{api_server::routes, config::ServiceConfig, storage::MemoryStore, ServiceContext};

fn ctx() -> Arc<ServiceContext> {
    ServiceContext::new(ServiceConfig::test(), Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn health_endpoint() {
    let api = routes(ctx());
    let response = warp::test::request().path("/health").reply(&api).await;
    assert_eq!(response.status(), 200);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_and_fetch_standard_room() {
    let api = routes(ctx());
    let response = warp::test::request()
        .method("POST")
        .path("/rooms/standard")
        .header("x-identity", "alice")
        .json(&json!({ "entry_fee": 20, "capacity": 2, "waiting_secs": 30 }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let room: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(room["status"], "waiting");
    assert_eq!(room["entry_fee"], 20);
    let id = room["id"].as_u64().unwrap();

    let response = warp::test::request()
        .path(&format!("/rooms/{id}"))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let fetched: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(fetched["id"].as_u64(), Some(id));
}

#[tokio::test]
async fn mutating_endpoints_require_identity() {
    let api = routes(ctx());
    let response = warp::test::request()
        .method("POST")
        .path("/rooms/standard")
        .json(&json!({ "entry_fee": 20 }))
        .reply(&api)
        .await;
    assert_ne!(response.status(), 200);
}

#[tokio::test]
async fn hero_room_gates_on_balance_then_creates_with_code() {
    let api = routes(ctx());

    let response = warp::test::request()
        .method("POST")
        .path("/rooms/hero")
        .header("x-identity", "bob")
        .json(&json!({ "entry_fee": 100, "capacity": 3 }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["code"], "validation_error");

    // Top up past the creation threshold and retry.
    let response = warp::test::request()
        .method("POST")
        .path("/wallet/payment")
        .header("x-identity", "bob")
        .json(&json!({ "amount": 600 }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);

    let response = warp::test::request()
        .method("POST")
        .path("/rooms/hero")
        .header("x-identity", "bob")
        .json(&json!({ "entry_fee": 100, "capacity": 3, "waiting_secs": 30 }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let room: Value = serde_json::from_slice(response.body()).unwrap();
    let code = room["join_code"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);

    let response = warp::test::request()
        .path(&format!("/rooms/hero/{code}"))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let fetched: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(fetched["id"], room["id"]);
}

#[tokio::test]
async fn join_and_status_flow() {
    let service = ctx();
    let api = routes(service.clone());

    let response = warp::test::request()
        .method("POST")
        .path("/rooms/standard")
        .header("x-identity", "alice")
        .json(&json!({ "entry_fee": 0, "capacity": 2, "waiting_secs": 30 }))
        .reply(&api)
        .await;
    let room: Value = serde_json::from_slice(response.body()).unwrap();
    let id = room["id"].as_u64().unwrap();

    for identity in ["alice", "carol"] {
        let response = warp::test::request()
            .method("POST")
            .path(&format!("/rooms/{id}/join"))
            .header("x-identity", identity)
            .reply(&api)
            .await;
        assert_eq!(response.status(), 200);
    }

    // Room filled: the game is running.
    let response = warp::test::request()
        .path(&format!("/rooms/{id}"))
        .reply(&api)
        .await;
    let fetched: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(fetched["status"], "active");
    assert!(fetched["game"].is_object());

    let response = warp::test::request().path("/status").reply(&api).await;
    assert_eq!(response.status(), 200);
    let status: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(status["stats"]["rooms_active"], 1);
    assert_eq!(status["stats"]["live_games"], 1);
}

#[tokio::test]
async fn leaderboard_periods() {
    let api = routes(ctx());
    for period in ["today", "week", "alltime"] {
        let response = warp::test::request()
            .path(&format!("/leaderboard/{period}"))
            .reply(&api)
            .await;
        assert_eq!(response.status(), 200);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body.as_array().unwrap().is_empty());
    }

    let response = warp::test::request()
        .path("/leaderboard/yesterday")
        .reply(&api)
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn bonus_start_opens_room_and_window() {
    let api = routes(ctx());
    let response = warp::test::request()
        .method("POST")
        .path("/bonus/start")
        .header("x-identity", "dave")
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["room"]["room_type"], "bonus");
    assert_eq!(body["room"]["status"], "active");
    assert_eq!(body["progress"]["taps"], 0);

    // Starting again reuses the running room.
    let response = warp::test::request()
        .method("POST")
        .path("/bonus/start")
        .header("x-identity", "dave")
        .reply(&api)
        .await;
    let again: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(again["room"]["id"], body["room"]["id"]);

    let response = warp::test::request()
        .method("POST")
        .path("/bonus/tap")
        .header("x-identity", "dave")
        .json(&json!({ "count": 30 }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let progress: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(progress["taps"], 30);
}
