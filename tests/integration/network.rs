//! Bridge over real TCP, in front of a real HTTP origin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use meshgate_core::wire::MAX_MESSAGE_LEN;
use meshgate_core::{Message, RequestId};
use meshgate_services::{
    BridgeClient, BridgeServer, ClientOptions, FetchRequest, HttpUpstream, QueryTransport,
    StreamConfig, TcpQueryClient, TcpQueryListener,
};

use crate::*;

async fn start_bridge(origin: SocketAddr) -> (BridgeServer, SocketAddr, CancellationToken) {
    let upstream = HttpUpstream::new(&format!("http://{origin}"), Duration::from_secs(5)).unwrap();
    let server = bridge(Arc::new(upstream), StreamConfig::default());
    let listener = TcpQueryListener::bind("127.0.0.1:0", Arc::new(server.clone()))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(listener.run(cancel.clone()));
    (server, addr, cancel)
}

#[tokio::test]
async fn fetch_through_tcp_bridge() {
    let origin = start_origin().await;
    let (server, addr, cancel) = start_bridge(origin).await;

    let conn = TcpQueryClient::connect(&addr.to_string()).await.unwrap();
    let client = BridgeClient::new(
        Arc::new(Schema::standard()),
        Arc::new(conn),
        ClientOptions::default(),
    );

    let hello = client.fetch(FetchRequest::get("/hello")).await.unwrap();
    assert_eq!(hello.head.status, 200);
    assert_eq!(&hello.body[..], b"hello");

    let big = client.fetch(FetchRequest::get("/big")).await.unwrap();
    assert_eq!(big.head.status, 200);
    assert_eq!(&big.body[..], &patterned(300_000)[..]);

    let missing = client.fetch(FetchRequest::get("/missing")).await.unwrap();
    assert_eq!(missing.head.status, 404);
    assert_eq!(&missing.body[..], b"no such page");

    assert!(server.streams().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn hop_by_hop_headers_stay_local() {
    let origin = start_origin().await;
    let (_server, addr, cancel) = start_bridge(origin).await;

    let conn = TcpQueryClient::connect(&addr.to_string()).await.unwrap();
    let client = BridgeClient::new(
        Arc::new(Schema::standard()),
        Arc::new(conn),
        ClientOptions::default(),
    );
    let resp = client.fetch(FetchRequest::get("/hello")).await.unwrap();
    for (name, _) in &resp.head.headers {
        assert!(!name.eq_ignore_ascii_case("transfer-encoding"));
        assert!(!name.eq_ignore_ascii_case("connection"));
    }
    cancel.cancel();
}

#[tokio::test]
async fn dropped_connection_releases_open_stream() {
    let origin = start_origin().await;
    let (server, addr, cancel) = start_bridge(origin).await;

    let conn = TcpQueryClient::connect(&addr.to_string()).await.unwrap();
    let answer = conn
        .query(
            get_request(RequestId::random(), "/big"),
            MAX_MESSAGE_LEN,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let schema = Schema::standard();
    assert!(matches!(schema.decode(&answer), Ok(Message::Response(_))));
    assert_eq!(server.streams().len(), 1);

    drop(conn);
    assert!(eventually(Duration::from_secs(2), || server.streams().is_empty()).await);
    cancel.cancel();
}
