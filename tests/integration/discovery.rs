//! Directory publishing and lookup over HTTP, and the control API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use meshgate_core::{Identity, NodeAddress};
use meshgate_services::{
    BridgeClient, ClientOptions, Directory, DirectoryError, FetchRequest, HttpDirectory,
    MemoryDirectory, PublishError, Publisher, PublisherConfig, StreamConfig, TcpQueryClient,
    TcpQueryListener,
};

use crate::*;

async fn serve_router(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn publish_and_find_over_http() {
    let store = MemoryDirectory::new();
    let addr = serve_router(meshgate_api::directory_router(store.clone())).await;
    let directory = Arc::new(HttpDirectory::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap());

    let node = Identity::generate().address;
    let publisher = Publisher::new(
        directory.clone(),
        node,
        "127.0.0.1:7420".to_string(),
        PublisherConfig::default(),
    );
    let published = publisher.publish_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(store.records().len(), 1);

    let found = directory.find(&node).await.unwrap();
    assert_eq!(found.address, node);
    assert_eq!(found.endpoint, "127.0.0.1:7420");
    assert_eq!(found.valid_until, published.valid_until);

    let stranger = NodeAddress::derive(b"never published");
    assert!(matches!(
        directory.find(&stranger).await,
        Err(DirectoryError::NotFound(a)) if a == stranger
    ));
}

#[tokio::test]
async fn unreachable_directory_is_unavailable() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let directory = HttpDirectory::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    let err = directory
        .find(&NodeAddress::derive(b"anyone"))
        .await
        .unwrap_err();
    assert!(matches!(err, DirectoryError::Unavailable(_)));
}

#[tokio::test]
async fn silent_directory_times_out() {
    // Accepts connections and never writes a byte.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((conn, _)) = listener.accept().await {
            held.push(conn);
        }
    });

    let directory = Arc::new(
        HttpDirectory::new(&format!("http://{addr}"), Duration::from_millis(200)).unwrap(),
    );
    let publisher = Publisher::new(
        directory,
        NodeAddress::derive(b"me"),
        "127.0.0.1:7420".to_string(),
        PublisherConfig {
            max_attempts: 2,
            retry_backoff: Duration::from_millis(10),
            ..PublisherConfig::default()
        },
    );
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        publisher.publish_once(&CancellationToken::new()),
    )
    .await
    .expect("publish cycle hung on a silent directory")
    .unwrap_err();
    assert!(matches!(err, PublishError::Exhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn resolve_then_fetch() {
    let origin = start_origin().await;
    let server = bridge(
        Arc::new(meshgate_services::HttpUpstream::new(&format!("http://{origin}"), Duration::from_secs(5)).unwrap()),
        StreamConfig::default(),
    );
    let listener = TcpQueryListener::bind("127.0.0.1:0", Arc::new(server))
        .await
        .unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(listener.run(cancel.clone()));

    let directory = Arc::new(MemoryDirectory::new());
    let node = Identity::generate().address;
    Publisher::new(directory.clone(), node, endpoint, PublisherConfig::default())
        .spawn(cancel.clone());

    assert!(eventually(Duration::from_secs(2), || !directory.records().is_empty()).await);
    let record = directory.find(&node).await.unwrap();

    let conn = TcpQueryClient::connect(&record.endpoint).await.unwrap();
    let client = BridgeClient::new(
        Arc::new(Schema::standard()),
        Arc::new(conn),
        ClientOptions::default(),
    );
    let resp = client.fetch(FetchRequest::get("/hello")).await.unwrap();
    assert_eq!(&resp.body[..], b"hello");
    cancel.cancel();
}

#[tokio::test]
async fn control_api_reports_status_and_schema() {
    let identity = Identity::generate();
    let server = bridge(StaticOrigin::ok(patterned(64)), StreamConfig::default());
    let shutdown = CancellationToken::new();
    let state = meshgate_api::ApiState {
        address: identity.address,
        schema: Arc::new(Schema::standard()),
        server: Some(server.clone()),
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
    };
    let addr = serve_router(meshgate_api::api_router(state)).await;

    server
        .handle(ctx(1), &get_request(meshgate_core::RequestId::random(), "/"))
        .await;

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["address"], identity.address.to_string());
    assert_eq!(status["serving"], true);
    assert_eq!(status["open_streams"], 1);

    let schema: serde_json::Value = reqwest::get(format!("http://{addr}/api/schema"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = schema["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"meshgate.http.request"));
    assert_eq!(names.len(), 5);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/daemon/shutdown"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(shutdown.is_cancelled());
}
