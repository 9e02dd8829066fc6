//! End-to-end behavior of the wired resilience layer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_resilience::admin::{self, AdminState};
use gateway_resilience::config::{parse_config, ResilienceConfig};
use gateway_resilience::lifecycle::{ResilienceLayer, Served, Shutdown};
use gateway_resilience::recovery::MemoryQueryStore;
use gateway_resilience::resilience::{CallError, CircuitState};
use gateway_resilience::storage::MemoryStore;
use serde_json::{json, Value};

mod common;

fn layer(config: &ResilienceConfig) -> ResilienceLayer {
    ResilienceLayer::with_store(config, Arc::new(MemoryQueryStore::new()), Arc::new(MemoryStore::new())).unwrap()
}

async fn get_json(client: reqwest::Client, url: String) -> Result<Value, String> {
    let res = client.get(&url).send().await.map_err(|e| e.to_string())?;
    if !res.status().is_success() {
        return Err(format!("{} from {}", res.status(), url));
    }
    res.json::<Value>().await.map_err(|e| e.to_string())
}

async fn counting_backend(status: u16, body: &'static str, delay: Duration) -> (SocketAddr, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let addr = common::start_programmable_backend(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            (status, body.to_string())
        }
    })
    .await;
    (addr, hits)
}

#[tokio::test]
async fn test_concurrent_identical_fetches_hit_backend_once() {
    let (addr, hits) = counting_backend(200, "{\"score\":710}", Duration::from_millis(200)).await;
    let layer = layer(&ResilienceConfig::default());
    let client = reqwest::Client::new();
    let url = format!("http://{}/credit-scoring/c1", addr);

    let fetches: Vec<_> = (0..5)
        .map(|_| {
            let (client, target) = (client.clone(), url.clone());
            layer.guarded_fetch("/credit-scoring", &url, None, move || get_json(client, target))
        })
        .collect();
    assert_eq!(layer.deduplicator.pending_count(), 1);

    for result in futures_util::future::join_all(fetches).await {
        assert_eq!(result, Ok(json!({"score": 710})));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(layer.deduplicator.pending_count(), 0);
}

#[tokio::test]
async fn test_failing_backend_opens_circuit_and_serves_fallback() {
    let config = parse_config(
        r#"
        [[circuit_breaker.endpoints]]
        endpoint = "/customer-360"
        failure_threshold = 2
        "#,
    )
    .unwrap();
    let layer = layer(&config);
    layer
        .degradation
        .store_fallback_data("customer-360", "c1", json!({"name": "cached"}));

    let (addr, hits) = counting_backend(503, "{}", Duration::ZERO).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/customer-360/c1", addr);

    for _ in 0..2 {
        let (client, url) = (client.clone(), url.clone());
        let served = layer
            .fetch_with_fallback("customer-360", "c1", move || get_json(client, url))
            .await
            .unwrap();
        assert_eq!(served, Served::Cached(json!({"name": "cached"})));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(layer.registry.state_of("/customer-360"), CircuitState::Open);

    let (c, u) = (client.clone(), url.clone());
    let refused = layer.guarded_fetch("/customer-360", &url, None, move || get_json(c, u)).await;
    assert_eq!(
        refused,
        Err(CallError::CircuitOpen {
            endpoint: "/customer-360".into()
        })
    );
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_admin_server_over_tcp() {
    let layer = Arc::new(layer(&ResilienceConfig::default()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = admin::setup_admin_router(AdminState {
        layer: layer.clone(),
        api_key: Arc::from("secret"),
    });
    let shutdown = Shutdown::new();
    let server = tokio::spawn(admin::serve(listener, router, shutdown.clone()));

    let client = reqwest::Client::new();
    let res = client
        .get(format!("http://{}/admin/circuits", addr))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.json::<Value>().await.unwrap(), json!([]));

    let res = client
        .get(format!("http://{}/admin/status", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    // Idle pooled connections would hold graceful shutdown open.
    drop(client);
    shutdown.trigger();
    server.await.unwrap().unwrap();
}
