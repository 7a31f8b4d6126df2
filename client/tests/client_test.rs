//! Client tests against an in-process fake server.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use batchline_client::{Client, ClientConfig, ClientError, CLIENT_VERSION};
use batchline_common::{
    Envelope, EnvelopeKind, ErrorBody, ErrorKind, Hello, HelloAck, NdArray, Payload, PoolSummary,
    ProtocolTag, ServerStatus,
};

/// Fake server that answers the handshake and status requests itself and
/// hands every `Request` frame to the test, which decides how to reply.
struct FakeServer {
    url: String,
    requests: mpsc::UnboundedReceiver<Envelope>,
    replies: mpsc::UnboundedSender<Envelope>,
}

fn fake_status(protocol: ProtocolTag) -> ServerStatus {
    ServerStatus {
        server_version: CLIENT_VERSION.to_string(),
        protocol,
        batch_size: 10,
        batch_group_timeout_ms: 5,
        num_worker: 1,
        num_worker_expanded: 0,
        device_map: vec![-1],
        device_to_expand: vec![0],
        connected_clients: 1,
        requests_received: 0,
        partitions_dispatched: 0,
        pending_partitions: 0,
        pool: PoolSummary::default(),
    }
}

async fn spawn_fake_server(protocol: ProtocolTag) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (rep_tx, mut rep_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                Some(env) = rep_rx.recv() => {
                    if write.send(Message::Binary(env.encode().to_vec())).await.is_err() {
                        break;
                    }
                }
                incoming = read.next() => {
                    let Some(Ok(Message::Binary(data))) = incoming else { break };
                    let env = Envelope::decode(Bytes::from(data)).unwrap();
                    let reply = match env.kind {
                        EnvelopeKind::Hello => {
                            let hello: Hello = env.decode_json().unwrap();
                            let ack = HelloAck {
                                identity: hello.identity,
                                server_version: CLIENT_VERSION.to_string(),
                                protocol,
                            };
                            Envelope::with_json(EnvelopeKind::HelloAck, &env.origin_id, 0, &ack).unwrap()
                        }
                        EnvelopeKind::StatusRequest => Envelope::with_json(
                            EnvelopeKind::StatusReply,
                            &env.origin_id,
                            env.request_id,
                            &fake_status(protocol),
                        )
                        .unwrap(),
                        EnvelopeKind::Request => {
                            let _ = req_tx.send(env);
                            continue;
                        }
                        _ => continue,
                    };
                    if write.send(Message::Binary(reply.encode().to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    FakeServer {
        url: format!("ws://{}/ws", addr),
        requests: req_rx,
        replies: rep_tx,
    }
}

fn echo_reply(request: &Envelope) -> Envelope {
    Envelope::reply(&request.origin_id, request.request_id, &request.decode_payload().unwrap()).unwrap()
}

#[tokio::test]
async fn test_replies_are_matched_regardless_of_arrival_order() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url).max_concurrency(2))
        .await
        .unwrap();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.encode(json!("first")).await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.encode(json!("second")).await }
    });

    let a = server.requests.recv().await.unwrap();
    let b = server.requests.recv().await.unwrap();
    // Answer in reverse order of arrival.
    server.replies.send(echo_reply(&b)).unwrap();
    server.replies.send(echo_reply(&a)).unwrap();

    assert_eq!(first.await.unwrap().unwrap(), Payload::Object(json!("first")));
    assert_eq!(second.await.unwrap().unwrap(), Payload::Object(json!("second")));
    assert_eq!(client.status().num_pending_request, 0);
}

#[tokio::test]
async fn test_timeout_releases_slot_and_late_reply_is_discarded() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(
        ClientConfig::new(&server.url).timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();

    let err = client.encode(json!("slow")).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(client.status().num_pending_request, 0);
    assert_eq!(client.available_slots(), 1);

    // The late reply must not be delivered to the next call.
    let late = server.requests.recv().await.unwrap();
    server.replies.send(echo_reply(&late)).unwrap();

    let next = tokio::spawn({
        let client = client.clone();
        async move { client.encode(json!("next")).await }
    });
    let req = server.requests.recv().await.unwrap();
    server.replies.send(echo_reply(&req)).unwrap();
    assert_eq!(next.await.unwrap().unwrap(), Payload::Object(json!("next")));
}

#[tokio::test]
async fn test_try_encode_fails_when_all_slots_are_taken() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url).max_concurrency(1))
        .await
        .unwrap();

    let held = tokio::spawn({
        let client = client.clone();
        async move { client.encode(json!("held")).await }
    });
    let req = server.requests.recv().await.unwrap();
    assert_eq!(client.available_slots(), 0);

    let err = client.try_encode(json!("rejected")).await.unwrap_err();
    assert!(matches!(err, ClientError::ConcurrencyExceeded(1)));

    server.replies.send(echo_reply(&req)).unwrap();
    held.await.unwrap().unwrap();
    assert_eq!(client.available_slots(), 1);
}

#[tokio::test]
async fn test_partial_reply_surfaces_counts() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url)).await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.encode(json!([1, 2, 3])).await }
    });
    let req = server.requests.recv().await.unwrap();
    let partial =
        Envelope::partial(&req.origin_id, req.request_id, &Payload::Object(json!([1])), 1, 3).unwrap();
    server.replies.send(partial).unwrap();

    match call.await.unwrap() {
        Err(ClientError::PartialResult {
            received,
            expected,
            payload,
        }) => {
            assert_eq!((received, expected), (1, 3));
            assert_eq!(payload, Payload::Object(json!([1])));
        }
        other => panic!("expected partial result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_remote_error_keeps_kind() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url)).await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.encode(json!("boom")).await }
    });
    let req = server.requests.recv().await.unwrap();
    let body = ErrorBody::new(ErrorKind::Inference, "model exploded");
    server
        .replies
        .send(Envelope::error(&req.origin_id, req.request_id, &body))
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Inference);
    assert!(err.to_string().contains("model exploded"));
}

#[tokio::test]
async fn test_connect_rejects_protocol_mismatch() {
    let server = spawn_fake_server(ProtocolTag::Numpy).await;
    let err = Client::connect(ClientConfig::new(&server.url)).await.err().unwrap();
    assert!(matches!(
        err,
        ClientError::ProtocolMismatch {
            server: ProtocolTag::Numpy,
            client: ProtocolTag::Obj
        }
    ));
}

#[tokio::test]
async fn test_ignore_all_checks_skips_protocol_check() {
    let server = spawn_fake_server(ProtocolTag::Numpy).await;
    let client = Client::connect(ClientConfig::new(&server.url).ignore_all_checks(true))
        .await
        .unwrap();
    assert_eq!(client.status().num_request, 0);
}

#[tokio::test]
async fn test_payload_must_match_connection_protocol() {
    let server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url)).await.unwrap();

    let arr = NdArray::from_slice(vec![2], &[1.0f32, 2.0]).unwrap();
    let err = client.encode(arr).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::WrongPayloadProtocol {
            expected: ProtocolTag::Obj,
            actual: ProtocolTag::Numpy
        }
    ));
}

#[tokio::test]
async fn test_server_status_round_trip() {
    let server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url).identity("tester"))
        .await
        .unwrap();

    let status = client.server_status().await.unwrap();
    assert_eq!(status.batch_size, 10);
    assert_eq!(client.identity(), "tester");
    // One status call at connect, one here.
    assert_eq!(client.status().num_request, 2);
}

#[tokio::test]
async fn test_blocking_calls_never_exceed_max_concurrency() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url).max_concurrency(3))
        .await
        .unwrap();

    let calls: Vec<_> = (0..12)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.encode(json!(i)).await })
        })
        .collect();

    let mut outstanding = Vec::new();
    let mut most = 0;
    for _ in 0..12 {
        if outstanding.is_empty() {
            outstanding.push(server.requests.recv().await.unwrap());
        }
        while let Ok(Some(req)) =
            tokio::time::timeout(Duration::from_millis(30), server.requests.recv()).await
        {
            outstanding.push(req);
        }
        assert!(outstanding.len() <= 3, "{} requests in flight", outstanding.len());
        most = most.max(outstanding.len());
        let req = outstanding.remove(0);
        server.replies.send(echo_reply(&req)).unwrap();
    }
    assert_eq!(most, 3);

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), Payload::Object(json!(i)));
    }
    assert_eq!(client.available_slots(), 3);
}

#[tokio::test]
async fn test_submitted_requests_are_fetched_in_sending_order() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url).max_concurrency(4))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for text in ["a", "b", "c"] {
        ids.push(client.submit(json!(text)).await.unwrap());
    }
    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.requests.recv().await.unwrap());
    }
    for req in requests.iter().rev() {
        server.replies.send(echo_reply(req)).unwrap();
    }

    let fetched = client.fetch_all(true).await;
    let got: Vec<(u64, Payload)> = fetched
        .into_iter()
        .map(|f| (f.request_id, f.result.unwrap()))
        .collect();
    assert_eq!(
        got,
        vec![
            (ids[0], Payload::Object(json!("a"))),
            (ids[1], Payload::Object(json!("b"))),
            (ids[2], Payload::Object(json!("c"))),
        ]
    );
    assert!(client.fetch().await.is_none());
}

#[tokio::test]
async fn test_fetch_reports_failed_submission() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url)).await.unwrap();

    let id = client.submit(json!("bad")).await.unwrap();
    let req = server.requests.recv().await.unwrap();
    let body = ErrorBody::new(ErrorKind::Inference, "rejected");
    server
        .replies
        .send(Envelope::error(&req.origin_id, req.request_id, &body))
        .unwrap();

    let fetched = client.fetch().await.unwrap();
    assert_eq!(fetched.request_id, id);
    assert_eq!(fetched.result.unwrap_err().kind(), ErrorKind::Inference);
    assert!(client.fetch().await.is_none());
}

#[tokio::test]
async fn test_encode_stream_yields_every_result() {
    let mut server = spawn_fake_server(ProtocolTag::Obj).await;
    let client = Client::connect(ClientConfig::new(&server.url).max_concurrency(2))
        .await
        .unwrap();

    tokio::spawn(async move {
        while let Some(req) = server.requests.recv().await {
            let _ = server.replies.send(echo_reply(&req));
        }
    });

    let inputs = futures_util::stream::iter((0..5).map(|i| json!([i, i + 1])));
    let results: Vec<_> = client.encode_stream(inputs).collect().await;

    let mut ids: Vec<u64> = results.iter().map(|f| f.request_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    let mut firsts: Vec<i64> = results
        .into_iter()
        .map(|f| match f.result.unwrap() {
            Payload::Object(value) => {
                assert_eq!(value[1].as_i64().unwrap(), value[0].as_i64().unwrap() + 1);
                value[0].as_i64().unwrap()
            }
            other => panic!("expected object, got {:?}", other),
        })
        .collect();
    firsts.sort_unstable();
    assert_eq!(firsts, vec![0, 1, 2, 3, 4]);
}
