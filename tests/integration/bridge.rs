//! Bridge server and client over the loopback transport.

use std::sync::Arc;
use std::time::Duration;

use meshgate_core::{ChunkRequest, ErrorCode, Message, RequestId};
use meshgate_services::{
    BridgeClient, ClientOptions, DrainOptions, FetchRequest, LoopbackTransport, StreamConfig,
};

use crate::*;

fn chunk_request(id: RequestId, seqno: i32, max: i32) -> bytes::Bytes {
    Message::ChunkRequest(ChunkRequest {
        id,
        seqno,
        max_chunk_size: max,
    })
    .encode()
}

fn error_code(m: Message) -> ErrorCode {
    match m {
        Message::Error(e) => e.code,
        other => panic!("expected error answer, got {other:?}"),
    }
}

#[tokio::test]
async fn large_body_arrives_in_three_chunks() {
    let body = patterned(300_000);
    let server = bridge(
        StaticOrigin::ok(body.clone()),
        StreamConfig {
            chunk_ceiling: 131_072,
            ..StreamConfig::default()
        },
    );
    let transport = Recording::new(Arc::new(LoopbackTransport::new(Arc::new(server.clone()), 1)));
    let client = BridgeClient::new(
        Arc::new(Schema::standard()),
        transport.clone(),
        ClientOptions::default(),
    );

    let resp = client.fetch(FetchRequest::get("/big")).await.unwrap();
    assert_eq!(resp.head.status, 200);
    assert_eq!(resp.body.len(), 300_000);
    assert_eq!(&resp.body[..], &body[..]);
    assert_eq!(
        *transport.chunk_sizes.lock().unwrap(),
        vec![131_072, 131_072, 37_856]
    );
    assert!(server.streams().is_empty());
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn oversized_client_chunk_still_delivers_whole_body() {
    let body = patterned(300_000);
    let server = bridge(StaticOrigin::ok(body.clone()), StreamConfig::default());
    let transport = Recording::new(Arc::new(LoopbackTransport::new(Arc::new(server.clone()), 1)));
    let client = BridgeClient::new(
        Arc::new(Schema::standard()),
        transport.clone(),
        ClientOptions {
            drain: DrainOptions {
                max_chunk: 256 * 1024,
                ..DrainOptions::default()
            },
            ..ClientOptions::default()
        },
    );

    let resp = client.fetch(FetchRequest::get("/big")).await.unwrap();
    assert_eq!(&resp.body[..], &body[..]);
    assert_eq!(
        *transport.chunk_sizes.lock().unwrap(),
        vec![131_072, 131_072, 37_856]
    );
    assert!(server.streams().is_empty());
}

#[tokio::test]
async fn chunk_request_above_ceiling_is_refused() {
    let server = bridge(
        StaticOrigin::ok(patterned(10_000)),
        StreamConfig {
            chunk_ceiling: 1024,
            ..StreamConfig::default()
        },
    );
    let id = RequestId::random();
    let Message::Response(_) = server.handle(ctx(1), &get_request(id, "/")).await else {
        panic!("expected response");
    };

    let answer = server.handle(ctx(1), &chunk_request(id, 0, 4096)).await;
    assert_eq!(error_code(answer), ErrorCode::ChunkTooLarge);
    assert!(server.streams().is_empty());
}

#[tokio::test]
async fn bodiless_response_opens_no_stream() {
    let server = bridge(StaticOrigin::no_content(), StreamConfig::default());
    let id = RequestId::random();

    let Message::Response(head) = server.handle(ctx(1), &get_request(id, "/")).await else {
        panic!("expected response");
    };
    assert_eq!(head.status, 204);
    assert!(head.no_body);
    assert!(server.streams().is_empty());

    let answer = server.handle(ctx(1), &chunk_request(id, 0, 1024)).await;
    assert_eq!(error_code(answer), ErrorCode::UnknownStream);

    let client = BridgeClient::new(
        Arc::new(Schema::standard()),
        Arc::new(LoopbackTransport::new(Arc::new(server.clone()), 1)),
        ClientOptions::default(),
    );
    let resp = client.fetch(FetchRequest::get("/")).await.unwrap();
    assert_eq!(resp.head.status, 204);
    assert!(resp.body.is_empty());
}

#[tokio::test]
async fn duplicate_request_id_is_refused() {
    let server = bridge(StaticOrigin::ok(patterned(4096)), StreamConfig::default());
    let id = RequestId::random();

    assert!(matches!(
        server.handle(ctx(1), &get_request(id, "/")).await,
        Message::Response(_)
    ));
    let again = server.handle(ctx(1), &get_request(id, "/")).await;
    assert_eq!(error_code(again), ErrorCode::DuplicateStream);
    assert_eq!(server.streams().len(), 1);
}

#[tokio::test]
async fn idle_stream_is_evicted() {
    let server = bridge(
        StaticOrigin::ok(patterned(4096)),
        StreamConfig {
            idle_timeout: Duration::from_millis(50),
            ..StreamConfig::default()
        },
    );
    let id = RequestId::random();
    server.handle(ctx(1), &get_request(id, "/")).await;
    assert_eq!(server.streams().len(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(server.streams().sweep(), 1);

    let answer = server.handle(ctx(1), &chunk_request(id, 0, 1024)).await;
    assert_eq!(error_code(answer), ErrorCode::UnknownStream);
}

#[tokio::test]
async fn racing_chunk_requests_serve_once() {
    let server = bridge(
        StaticOrigin::ok(patterned(4096)),
        StreamConfig {
            chunk_ceiling: 1024,
            ..StreamConfig::default()
        },
    );
    let id = RequestId::random();
    server.handle(ctx(1), &get_request(id, "/")).await;

    let q = chunk_request(id, 0, 1024);
    let (a, b) = tokio::join!(server.handle(ctx(1), &q), server.handle(ctx(1), &q));

    let (chunk, refused) = match (a, b) {
        (Message::Chunk(c), other) | (other, Message::Chunk(c)) => (c, other),
        other => panic!("expected one chunk, got {other:?}"),
    };
    assert_eq!(chunk.data.len(), 1024);
    assert!(!chunk.last);
    assert_eq!(error_code(refused), ErrorCode::SequenceMismatch);

    // The stream itself survives the refused duplicate.
    let Message::Chunk(next) = server.handle(ctx(1), &chunk_request(id, 1, 1024)).await else {
        panic!("expected chunk 1");
    };
    assert_eq!(next.data.len(), 1024);
}

#[tokio::test]
async fn closing_connection_releases_its_streams() {
    let server = bridge(StaticOrigin::ok(patterned(4096)), StreamConfig::default());
    let kept = RequestId::random();
    let dropped = RequestId::random();
    server.handle(ctx(1), &get_request(kept, "/")).await;
    server.handle(ctx(2), &get_request(dropped, "/")).await;
    assert_eq!(server.streams().len(), 2);

    LoopbackTransport::new(Arc::new(server.clone()), 2).close().await;

    assert_eq!(server.streams().len(), 1);
    assert!(server.streams().contains(&kept));
    assert!(!server.streams().contains(&dropped));
}
