//! End-to-end tests: a real upstream on a loopback port, the proxy in
//! between, and either direct `ProxyServer::web` calls or raw client sockets.

use bifrost_relay::common::{empty_body, full_body};
use bifrost_relay::events::{EventKind, ProxyEvent};
use bifrost_relay::options::{ProxyOptions, Target};
use bifrost_relay::proxy::{CallOptions, ProxyServer};
use bifrost_relay::server::{DEFAULT_MAX_HEADER_SIZE, serve_listener};
use bifrost_relay::ProxyError;
use bytes::Bytes;
use http::header::HeaderValue;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

async fn spawn_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Answers with `"<method> <uri> <body>"` and reflects a few request headers.
async fn echo(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    let text = format!(
        "{} {} {}",
        parts.method,
        parts.uri,
        String::from_utf8_lossy(&body)
    );

    let mut response = Response::new(Full::new(Bytes::from(text)));
    for name in ["host", "x-forwarded-for", "x-special-proxy-header"] {
        if let Some(value) = parts.headers.get(name) {
            response
                .headers_mut()
                .insert(format!("x-seen-{}", name).parse::<http::HeaderName>().unwrap(), value.clone());
        }
    }
    response
}

async fn spawn_proxy(proxy: ProxyServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_listener(Arc::new(proxy), listener, DEFAULT_MAX_HEADER_SIZE));
    addr
}

async fn body_text(response: Response<bifrost_relay::common::ProxyBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_web_request_reaches_upstream_through_listener() {
    let upstream = spawn_upstream(echo).await;
    let mut options = ProxyOptions::new(format!("http://{}/api", upstream).as_str());
    options.xfwd = Some(true);
    let proxy_addr = spawn_proxy(ProxyServer::new(options)).await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .method("POST")
        .uri("/users?id=1")
        .header("host", "proxy.local")
        .body(Full::new(Bytes::from("hello")))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-seen-host"], "proxy.local");
    assert_eq!(response.headers()["x-seen-x-forwarded-for"], "127.0.0.1");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"POST /api/users?id=1 hello");
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let upstream = spawn_upstream(echo).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut proxy = ProxyServer::new(ProxyOptions::new(format!("http://{}", upstream).as_str()));
    for (kind, name) in [
        (EventKind::Start, "start"),
        (EventKind::ProxyReq, "proxy_req"),
        (EventKind::ProxyRes, "proxy_res"),
        (EventKind::End, "end"),
    ] {
        let seen = seen.clone();
        proxy.on(kind, move |_| seen.lock().unwrap().push(name));
    }
    proxy.on(EventKind::ProxyReq, |event| {
        if let ProxyEvent::ProxyReq { outgoing, .. } = event {
            outgoing
                .headers
                .insert("x-special-proxy-header", HeaderValue::from_static("foobar"));
        }
    });

    let request = Request::builder().uri("/").body(empty_body()).unwrap();
    let response = proxy.web(request, CallOptions::default()).await;

    assert_eq!(response.headers()["x-seen-x-special-proxy-header"], "foobar");
    assert_eq!(*seen.lock().unwrap(), ["start", "proxy_req", "proxy_res", "end"]);
}

#[tokio::test]
async fn test_refused_upstream_goes_to_callback_with_502() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let events = Arc::new(Mutex::new(0));
    let counter = events.clone();
    let mut proxy = ProxyServer::new(ProxyOptions::new(format!("http://{}", closed).as_str()));
    proxy.on(EventKind::Error, move |_| *counter.lock().unwrap() += 1);

    let kind = Arc::new(Mutex::new(None));
    let slot = kind.clone();
    let call = CallOptions::default().with_error_callback(move |error, _| {
        *slot.lock().unwrap() = error.io_kind();
    });

    let request = Request::builder().uri("/").body(empty_body()).unwrap();
    let response = proxy.web(request, call).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        *kind.lock().unwrap(),
        Some(std::io::ErrorKind::ConnectionRefused)
    );
    assert_eq!(*events.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_proxy_timeout_aborts_slow_upstream() {
    let upstream = spawn_upstream(|req| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        echo(req).await
    })
    .await;

    let mut options = ProxyOptions::new(format!("http://{}", upstream).as_str());
    options.proxy_timeout = Some(50);
    let proxy = ProxyServer::new(options);

    let timed_out = Arc::new(Mutex::new(false));
    let flag = timed_out.clone();
    let call = CallOptions::default().with_error_callback(move |error, _| {
        *flag.lock().unwrap() = matches!(error, ProxyError::Timeout { millis: 50, .. });
    });

    let request = Request::builder().uri("/slow").body(empty_body()).unwrap();
    let response = proxy.web(request, call).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(*timed_out.lock().unwrap());
}

#[tokio::test]
async fn test_forward_only_answers_200_and_mirrors_request() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mirror = spawn_upstream(move |req: Request<Incoming>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(req.uri().to_string());
            Response::new(Full::new(Bytes::new()))
        }
    })
    .await;

    let proxy = ProxyServer::new(ProxyOptions {
        forward: Some(Target::from(format!("http://{}", mirror).as_str())),
        ..ProxyOptions::default()
    });

    let request = Request::builder()
        .uri("/audit?x=1")
        .body(full_body("payload"))
        .unwrap();
    let response = proxy.web(request, CallOptions::default()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "");

    let forwarded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, "/audit?x=1");
}

#[tokio::test]
async fn test_forward_and_target_both_receive_body() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mirror = spawn_upstream(move |req: Request<Incoming>| {
        let tx = tx.clone();
        async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let _ = tx.send(body);
            Response::new(Full::new(Bytes::new()))
        }
    })
    .await;
    let upstream = spawn_upstream(echo).await;

    let mut options = ProxyOptions::new(format!("http://{}", upstream).as_str());
    options.forward = Some(Target::from(format!("http://{}", mirror).as_str()));
    let proxy = ProxyServer::new(options);

    let request = Request::builder()
        .method("PUT")
        .uri("/doc")
        .body(full_body("shared body"))
        .unwrap();
    let response = proxy.web(request, CallOptions::default()).await;
    assert_eq!(body_text(response).await, "PUT /doc shared body");

    let mirrored = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&mirrored[..], b"shared body");
}

#[tokio::test]
async fn test_redirect_location_follows_inbound_host() {
    let upstream = spawn_upstream(|_req| async move {
        Response::builder()
            .status(StatusCode::FOUND)
            .header("location", "PLACEHOLDER")
            .body(Full::new(Bytes::new()))
            .unwrap()
    })
    .await;
    // The upstream does not know its own port, so a ProxyRes listener fills
    // in the location before the outgoing passes see it.
    let target_host = upstream.to_string();
    let mut options = ProxyOptions::new(format!("http://{}", upstream).as_str());
    options.auto_rewrite = Some(true);
    let mut proxy = ProxyServer::new(options);
    proxy.on(EventKind::ProxyRes, move |event| {
        if let ProxyEvent::ProxyRes { response, .. } = event {
            let location = format!("http://{}/login?next=%2F", target_host);
            response
                .headers
                .insert("location", HeaderValue::from_str(&location).unwrap());
        }
    });

    let request = Request::builder()
        .uri("/account")
        .header("host", "proxy.local:8080")
        .body(empty_body())
        .unwrap();
    let response = proxy.web(request, CallOptions::default()).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        "http://proxy.local:8080/login?next=%2F"
    );
}

/// Upstream that accepts any upgrade and then echoes every byte back.
async fn spawn_ws_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_head(&mut stream).await;
                stream
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n",
                    )
                    .await
                    .unwrap();
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_websocket_relay_round_trip() {
    let upstream = spawn_ws_echo_upstream().await;
    let mut options = ProxyOptions::new(format!("ws://{}", upstream).as_str());
    options.ws = Some(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut proxy = ProxyServer::new(options);
    for (kind, name) in [
        (EventKind::ProxyReqWs, "proxy_req_ws"),
        (EventKind::Open, "open"),
        (EventKind::ProxySocket, "proxy_socket"),
        (EventKind::Close, "close"),
    ] {
        let tx = tx.clone();
        proxy.on(kind, move |_| {
            let _ = tx.send(name);
        });
    }
    let proxy_addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.to_ascii_lowercase().contains("upgrade: websocket"));

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();

    let mut names = Vec::new();
    while names.last() != Some(&"close") {
        let name = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        names.push(name);
    }
    assert_eq!(names, ["proxy_req_ws", "open", "proxy_socket", "close"]);
}

#[tokio::test]
async fn test_websocket_refusal_is_relayed() {
    let upstream = spawn_upstream(|_req| async move {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("no socket here")))
            .unwrap()
    })
    .await;
    let mut options = ProxyOptions::new(format!("http://{}", upstream).as_str());
    options.ws = Some(true);
    let proxy_addr = spawn_proxy(ProxyServer::new(options)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET /missing HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8(reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(reply.ends_with("no socket here"));
}

#[tokio::test]
async fn test_websocket_upgrade_with_wrong_method_is_dropped() {
    let upstream = spawn_ws_echo_upstream().await;
    let mut options = ProxyOptions::new(format!("ws://{}", upstream).as_str());
    options.ws = Some(true);
    let proxy_addr = spawn_proxy(ProxyServer::new(options)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let mut reply = Vec::new();
    let _ = client.read_to_end(&mut reply).await;
    assert!(reply.is_empty());
}

/// Raw upstream that reports each request head it receives and answers with
/// `reply` verbatim.
async fn spawn_raw_upstream(reply: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let head = read_head(&mut stream).await;
            let _ = tx.send(head);
            stream.write_all(reply).await.unwrap();
        }
    });
    (addr, rx)
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (client, accepted)
}

const UPGRADE_REQUEST: &[u8] =
    b"GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";

#[tokio::test]
async fn test_websocket_close_fires_when_upstream_ends_first() {
    let (upstream, _heads) = spawn_raw_upstream(
        b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n",
    )
    .await;
    let mut options = ProxyOptions::new(format!("ws://{}", upstream).as_str());
    options.ws = Some(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut proxy = ProxyServer::new(options);
    proxy.on(EventKind::Close, move |_| {
        let _ = tx.send(());
    });
    let proxy_addr = spawn_proxy(proxy).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(UPGRADE_REQUEST).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"));

    let mut byte = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut byte))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // The client never closes its side.
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    drop(client);
}

#[tokio::test]
async fn test_websocket_bytes_after_upgrade_head_reach_upstream() {
    let upstream = spawn_ws_echo_upstream().await;
    let mut options = ProxyOptions::new(format!("ws://{}", upstream).as_str());
    options.ws = Some(true);
    let proxy_addr = spawn_proxy(ProxyServer::new(options)).await;

    let mut request = UPGRADE_REQUEST.to_vec();
    request.extend_from_slice(b"early");

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&request).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"));

    let mut echoed = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"early");
}

#[tokio::test]
async fn test_websocket_upstream_reset_emits_error_and_ends_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stream);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut proxy = ProxyServer::new(ProxyOptions::new(format!("ws://{}", upstream).as_str()));
    let errors = tx.clone();
    proxy.on(EventKind::Error, move |event| {
        if let ProxyEvent::Error { error, .. } = event {
            let _ = errors.send(if matches!(**error, ProxyError::Relay(_)) {
                "relay_error"
            } else {
                "other_error"
            });
        }
    });
    proxy.on(EventKind::Close, move |_| {
        let _ = tx.send("close");
    });

    let callback_hits = Arc::new(Mutex::new(0));
    let counter = callback_hits.clone();
    let call = CallOptions::default().with_error_callback(move |_, _| {
        *counter.lock().unwrap() += 1;
    });

    let (mut client, accepted) = tcp_pair().await;
    let request = Request::builder()
        .uri("/chat")
        .header("host", "localhost")
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .body(())
        .unwrap();
    tokio::spawn(async move { proxy.ws(request, Box::new(accepted), call).await });

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"));
    client.write_all(b"ping").await.unwrap();

    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap();

    let mut names = Vec::new();
    while names.last() != Some(&"close") {
        let name = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        names.push(name);
    }
    assert_eq!(names, ["relay_error", "close"]);
    assert_eq!(*callback_hits.lock().unwrap(), 0);
}

async fn response_head_through_proxy(preserve: bool) -> String {
    let (upstream, _heads) = spawn_raw_upstream(
        b"HTTP/1.1 200 OK\r\nX-Mixed-Case: yes\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    let mut options = ProxyOptions::new(format!("http://{}", upstream).as_str());
    options.preserve_header_key_case = Some(preserve);
    let proxy_addr = spawn_proxy(ProxyServer::new(options)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    read_head(&mut client).await
}

#[tokio::test]
async fn test_preserve_header_key_case_on_the_wire() {
    let preserved = response_head_through_proxy(true).await;
    assert!(preserved.contains("\r\nX-Mixed-Case: yes\r\n"), "{}", preserved);

    let lowered = response_head_through_proxy(false).await;
    assert!(lowered.contains("\r\nx-mixed-case: yes\r\n"), "{}", lowered);
}

async fn redirecting(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let location = match req.uri().path() {
        "/old" => "/new",
        "/loop" => "/loop",
        _ => return echo(req).await,
    };
    Response::builder()
        .status(StatusCode::FOUND)
        .header("location", location)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn test_follow_redirects_chases_upstream_location() {
    let upstream = spawn_upstream(redirecting).await;
    let target = format!("http://{}", upstream);

    let passthrough = ProxyServer::new(ProxyOptions::new(target.as_str()));
    let request = Request::builder().uri("/old").body(empty_body()).unwrap();
    let response = passthrough.web(request, CallOptions::default()).await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let mut options = ProxyOptions::new(target.as_str());
    options.follow_redirects = Some(true);
    options.max_redirects = Some(3);
    let following = ProxyServer::new(options);

    let request = Request::builder()
        .method("POST")
        .uri("/old")
        .body(full_body("data"))
        .unwrap();
    let response = following.web(request, CallOptions::default()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /new ");

    let request = Request::builder().uri("/loop").body(empty_body()).unwrap();
    let response = following.web(request, CallOptions::default()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
