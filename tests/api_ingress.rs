//! HTTP ingress against in-memory adapters.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use orderflow::adapters::{BrokerChannel, InMemoryBroker, InMemoryStore, OrderStore};
use orderflow::api::{create_router, AppState};
use orderflow::config::TopologyConfig;
use orderflow::coordination::ChannelSlot;
use orderflow::domain::OrderStatus;
use orderflow::pipeline::{OrderProducer, TopologyManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceExt;

struct App {
    router: Router,
    store: InMemoryStore,
    broker: InMemoryBroker,
}

async fn app(with_channel: bool) -> App {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let topology = TopologyConfig::default();
    TopologyManager::new(topology.clone(), 5000)
        .declare(&broker)
        .await
        .unwrap();

    let channel: Option<Arc<dyn BrokerChannel>> = if with_channel {
        Some(Arc::new(broker.clone()))
    } else {
        None
    };
    let slot: ChannelSlot = Arc::new(RwLock::new(channel));
    let producer = Arc::new(OrderProducer::new(Arc::new(store.clone()), slot, &topology));

    App {
        router: create_router(AppState::new(producer)),
        store,
        broker,
    }
}

fn post_json(body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/orders")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn valid_order() -> String {
    json!({"userId": "user-1", "productId": "product-9", "quantity": 2}).to_string()
}

#[tokio::test]
async fn accepted_order_is_stored_pending_and_published() {
    let app = app(true).await;

    let (status, body) = send(&app.router, post_json(valid_order())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["message"], "Order received for processing");
    let order_id = body["orderId"].as_str().unwrap().to_string();
    assert!(!order_id.is_empty());

    let stored = app.store.get_order(&order_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.quantity, 2);

    let queue = &TopologyConfig::default().queue;
    assert_eq!(app.broker.queue_len(queue).await, 1);
}

#[tokio::test]
async fn invalid_bodies_are_rejected_with_400() {
    let app = app(true).await;
    let bodies = [
        json!({"userId": "u", "productId": "p", "quantity": 0}).to_string(),
        json!({"userId": "u", "productId": "p", "quantity": -3}).to_string(),
        json!({"userId": "", "productId": "p", "quantity": 1}).to_string(),
        json!({"productId": "p", "quantity": 1}).to_string(),
        "{not json".to_string(),
    ];

    for body in bodies {
        let (status, response) = send(&app.router, post_json(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        let response: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(response, json!({"error": "Invalid input"}));
    }

    assert_eq!(app.broker.queue_len(&TopologyConfig::default().queue).await, 0);
}

#[tokio::test]
async fn broker_outage_still_accepts_the_order() {
    let app = app(false).await;

    let (status, body) = send(&app.router, post_json(valid_order())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body: Value = serde_json::from_slice(&body).unwrap();
    let order_id = body["orderId"].as_str().unwrap();
    let stored = app.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
}

#[tokio::test]
async fn store_outage_is_an_internal_error() {
    let app = app(true).await;
    app.store.set_unavailable(true);

    let (status, body) = send(&app.router, post_json(valid_order())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(app.broker.queue_len(&TopologyConfig::default().queue).await, 0);
}

#[tokio::test]
async fn order_status_lookup() {
    let app = app(true).await;
    let (_, body) = send(&app.router, post_json(valid_order())).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    let order_id = body["orderId"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, get(&format!("/api/orders/{order_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let order: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(order["orderId"], order_id.as_str());
    assert_eq!(order["status"], "PENDING");
    assert_eq!(order["retryCount"], 0);

    let (status, body) = send(&app.router, get("/api/orders/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Order not found");
}

#[tokio::test]
async fn liveness_probe() {
    let app = app(false).await;
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}
