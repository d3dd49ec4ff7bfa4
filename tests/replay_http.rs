use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    ext::ReasonPhrase,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use reqscope::{
    codec::parse_raw_request,
    replay::{HostMismatchPolicy, ReplayDispatcher, ReplayOutcome},
    transport::HyperTransport,
};
use tokio::{net::TcpListener, sync::mpsc};

#[derive(Debug)]
struct CapturedRequest {
    method: Method,
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

async fn spawn_upstream() -> (SocketAddr, mpsc::Receiver<CapturedRequest>) {
    spawn_upstream_with_reason(None).await
}

async fn spawn_upstream_with_reason(
    reason: Option<&'static [u8]>,
) -> (SocketAddr, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel::<CapturedRequest>(4);

    tokio::spawn(async move {
        let tx = Arc::new(tx);
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let io = TokioIo::new(stream);
            let tx = Arc::clone(&tx);
            let service = service_fn(move |req: Request<Incoming>| {
                let tx = Arc::clone(&tx);
                async move {
                    let (parts, body) = req.into_parts();
                    let body_bytes = body.collect().await.unwrap().to_bytes();
                    tx.send(CapturedRequest {
                        method: parts.method,
                        uri: parts.uri,
                        headers: parts.headers,
                        body: body_bytes,
                    })
                    .await
                    .unwrap();

                    let mut res = Response::new(Full::new(Bytes::from_static(b"upstream-body")));
                    *res.status_mut() = StatusCode::CREATED;
                    res.headers_mut()
                        .insert("x-resp-end", HeaderValue::from_static("ok"));
                    if let Some(reason) = reason {
                        res.extensions_mut()
                            .insert(ReasonPhrase::from_static(reason));
                    }
                    Ok::<_, hyper::Error>(res)
                }
            });
            tokio::spawn(async move {
                let builder = ConnectionBuilder::new(TokioExecutor::new());
                let _ = builder.serve_connection(io, service).await;
            });
        }
    });

    (addr, rx)
}

fn dispatcher() -> ReplayDispatcher<HyperTransport> {
    ReplayDispatcher::new(
        HyperTransport::new().expect("transport should build"),
        HostMismatchPolicy::Allow,
    )
}

#[tokio::test]
async fn replays_raw_request_against_live_server() {
    let (addr, mut upstream_rx) = spawn_upstream().await;
    let raw = format!(
        "POST /submit?x=1 HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Cookie: session=abc\r\n\
         Connection: x-hop\r\n\
         X-Hop: secret\r\n\
         Content-Length: 999\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         payload"
    );
    let parsed = parse_raw_request(&raw).expect("request should parse");
    assert_eq!(parsed.url, format!("http://{addr}/submit?x=1"));

    let outcome = dispatcher().dispatch(&parsed).await;
    let ReplayOutcome::Completed(result) = outcome else {
        panic!("expected completed replay, got {outcome:?}");
    };

    let captured = upstream_rx.recv().await.expect("upstream should see the request");
    assert_eq!(captured.method, Method::POST);
    assert_eq!(captured.uri.path_and_query().unwrap().as_str(), "/submit?x=1");
    assert_eq!(captured.body, Bytes::from_static(b"payload"));
    assert_eq!(captured.headers.get(header::COOKIE).unwrap(), "session=abc");
    assert_eq!(captured.headers.get(header::CONTENT_LENGTH).unwrap(), "7");
    assert!(captured.headers.get("x-hop").is_none());
    assert_eq!(
        captured.headers.get(header::HOST).unwrap(),
        addr.to_string().as_str()
    );

    assert_eq!(result.response.status, 201);
    assert_eq!(result.response.status_text, "Created");
    assert_eq!(result.response_size, "upstream-body".len());
    assert!(
        result.raw_response.starts_with("HTTP/1.1 201 Created\r\n"),
        "raw: {}",
        result.raw_response
    );
    assert!(result.raw_response.contains("x-resp-end: ok\r\n"));
    assert!(result.raw_response.ends_with("\r\n\r\nupstream-body"));
}

#[tokio::test]
async fn replay_keeps_reason_phrase_sent_by_server() {
    let (addr, _upstream_rx) = spawn_upstream_with_reason(Some(b"Everything Fine")).await;
    let parsed = parse_raw_request(&format!("GET /ok HTTP/1.1\r\nHost: {addr}\r\n\r\n"))
        .expect("request should parse");

    let ReplayOutcome::Completed(result) = dispatcher().dispatch(&parsed).await else {
        panic!("expected completed replay");
    };
    assert_eq!(result.response.status_text, "Everything Fine");
    assert!(
        result
            .raw_response
            .starts_with("HTTP/1.1 201 Everything Fine\r\n"),
        "raw: {}",
        result.raw_response
    );
}

#[tokio::test]
async fn get_replay_drops_body_text() {
    let (addr, mut upstream_rx) = spawn_upstream().await;
    let parsed = parse_raw_request(&format!(
        "GET /items HTTP/1.1\r\nHost: {addr}\r\n\r\nnot-sent"
    ))
    .expect("request should parse");

    assert!(matches!(
        dispatcher().dispatch(&parsed).await,
        ReplayOutcome::Completed(_)
    ));
    let captured = upstream_rx.recv().await.expect("upstream should see the request");
    assert_eq!(captured.method, Method::GET);
    assert!(captured.body.is_empty());
}

#[tokio::test]
async fn unreachable_target_reports_failure_text() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let parsed = parse_raw_request(&format!("GET / HTTP/1.1\r\nHost: {addr}\r\n\r\n"))
        .expect("request should parse");
    let ReplayOutcome::Failed { message } = dispatcher().dispatch(&parsed).await else {
        panic!("expected failed replay");
    };
    assert!(message.starts_with("request failed: "), "message: {message}");
}
