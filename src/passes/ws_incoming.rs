//! WebSocket upgrade pipeline.
//!
//! `stream` asks the upstream to switch protocols. A refusal is written back
//! to the client verbatim; a `101` turns both sockets into a byte relay that
//! lives until the upstream closes.

use super::{ErrorCallback, WsExchange, WsPass, append_x_forwarded, report_error};
use crate::common::empty_body;
use crate::error::ProxyError;
use crate::events::{EventRegistry, ProxyEvent, UpstreamInfo};
use crate::options::ProxyOptions;
use crate::outgoing::OutgoingRequest;
use crate::socket::{BoxSocket, Rewind};
use crate::transport;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use http::header::{TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, request};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Method, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub fn passes() -> Vec<(&'static str, WsPass)> {
    vec![
        ("check_method_and_header", check_method_and_header as WsPass),
        ("x_headers", x_headers as WsPass),
        ("stream", stream as WsPass),
    ]
}

/// Only `GET` with `upgrade: websocket` may proceed; anything else has its
/// socket dropped without a reply.
pub fn check_method_and_header(exchange: &mut WsExchange) -> BoxFuture<'_, bool> {
    let request = &exchange.request;
    let is_websocket = request
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if request.method != Method::GET || !is_websocket {
        debug!(
            "Rejecting upgrade: {} {} is not a websocket handshake",
            request.method, request.uri
        );
        exchange.socket = None;
        return future::ready(true).boxed();
    }
    future::ready(false).boxed()
}

pub fn x_headers(exchange: &mut WsExchange) -> BoxFuture<'_, bool> {
    if exchange.options.xfwd_enabled() {
        append_x_forwarded(&mut exchange.request, "ws", "wss");
    }
    future::ready(false).boxed()
}

pub fn stream(exchange: &mut WsExchange) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        if let Some(socket) = exchange.socket.take() {
            relay(
                socket,
                &exchange.request,
                &exchange.head,
                &exchange.options,
                &exchange.events,
                exchange.on_error.as_ref(),
            )
            .await;
        }
        true
    })
}

async fn relay(
    mut socket: BoxSocket,
    request: &request::Parts,
    head: &Bytes,
    options: &ProxyOptions,
    events: &EventRegistry,
    on_error: Option<&ErrorCallback>,
) {
    socket.setup();
    let mut socket: BoxSocket = if head.is_empty() {
        socket
    } else {
        Box::new(Rewind::new(head.clone(), socket))
    };

    let mut outgoing = match OutgoingRequest::build(options.ssl.as_ref(), options, request, false) {
        Ok(outgoing) => outgoing,
        Err(e) => {
            report_error(events, on_error, &e, request);
            end(&mut socket).await;
            return;
        }
    };
    events.emit(&mut ProxyEvent::ProxyReqWs {
        outgoing: &mut outgoing,
        request,
        options,
        head,
    });

    let upstream = UpstreamInfo {
        origin: outgoing.origin(),
    };
    let mut response = match transport::send(outgoing, empty_body(), true).await {
        Ok(response) => response,
        Err(e) => {
            report_error(events, on_error, &e, request);
            end(&mut socket).await;
            return;
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(
            "{} declined the upgrade with {}",
            upstream.origin,
            response.status()
        );
        if let Err(e) = write_refusal(&mut socket, response).await {
            debug!("Failed to relay upgrade refusal: {}", e);
        }
        end(&mut socket).await;
        return;
    }

    let on_upgrade = hyper::upgrade::on(&mut response);
    let (parts, _) = response.into_parts();
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            let error = ProxyError::connection(upstream.origin.clone(), e);
            report_error(events, on_error, &error, request);
            end(&mut socket).await;
            return;
        }
    };

    let handshake = header_block("HTTP/1.1 101 Switching Protocols", &parts.headers);
    if let Err(e) = write_all_flush(&mut socket, &handshake).await {
        let error = ProxyError::Relay(e);
        events.emit(&mut ProxyEvent::Error {
            error: &error,
            request,
        });
        end(&mut socket).await;
        return;
    }

    events.emit(&mut ProxyEvent::Open {
        upstream: &upstream,
    });
    events.emit(&mut ProxyEvent::ProxySocket {
        upstream: &upstream,
    });
    info!("WebSocket relay open: {} <-> {}", request.uri, upstream.origin);

    let (mut client_read, mut client_write) = tokio::io::split(socket);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(TokioIo::new(upgraded));

    // The relay ends with the upstream stream. A client that finishes first
    // only half-closes the upstream and keeps receiving.
    let outcome = {
        let client_to_upstream = async {
            let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
            let _ = upstream_write.shutdown().await;
            copied
        };
        let upstream_to_client = async {
            let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            copied
        };
        tokio::pin!(client_to_upstream, upstream_to_client);

        let mut sent = None;
        loop {
            tokio::select! {
                up = &mut client_to_upstream, if sent.is_none() => match up {
                    Ok(bytes) => sent = Some(bytes),
                    Err(e) => break Err(e),
                },
                down = &mut upstream_to_client => break down.map(|received| (sent, received)),
            }
        }
    };

    match outcome {
        Ok((sent, received)) => debug!(
            "WebSocket relay with {} closed: {} bytes up, {} bytes down",
            upstream.origin,
            sent.unwrap_or_default(),
            received
        ),
        Err(e) => {
            let error = ProxyError::Relay(e);
            events.emit(&mut ProxyEvent::Error {
                error: &error,
                request,
            });
            let _ = upstream_write.shutdown().await;
            let _ = client_write.shutdown().await;
        }
    }
    drop((client_read, client_write, upstream_read, upstream_write));

    events.emit(&mut ProxyEvent::Close {
        response: &parts,
        upstream: &upstream,
        head,
    });
}

/// Raw HTTP/1.1 head: the status line followed by one line per header value.
fn header_block(status_line: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::with_capacity(256);
    block.extend_from_slice(status_line.as_bytes());
    block.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block.extend_from_slice(b"\r\n");
    block
}

/// Replays a non-101 upstream answer to the client. The body is written
/// unframed, so transfer-encoding is dropped and the socket is closed after.
async fn write_refusal<W>(socket: &mut W, response: Response<Incoming>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (mut parts, mut body) = response.into_parts();
    let reason = parts
        .extensions
        .get::<ReasonPhrase>()
        .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned())
        .or_else(|| parts.status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    parts.headers.remove(TRANSFER_ENCODING);

    let status_line = format!("HTTP/1.1 {} {}", parts.status.as_u16(), reason);
    socket.write_all(&header_block(&status_line, &parts.headers)).await?;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(io::Error::other)?;
        if let Ok(data) = frame.into_data() {
            socket.write_all(&data).await?;
        }
    }
    socket.flush().await
}

async fn write_all_flush<W>(socket: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    socket.write_all(bytes).await?;
    socket.flush().await
}

/// Ends the client socket. Already-closed sockets are fine.
async fn end(socket: &mut BoxSocket) {
    if let Err(e) = socket.shutdown().await {
        debug!("Socket already closed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use http::header::HeaderValue;
    use hyper::Request;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;

    fn exchange(method: &str, headers: &[(&str, &str)]) -> (WsExchange, tokio::io::DuplexStream) {
        let mut builder = Request::builder().method(method).uri("/socket");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (client, server) = tokio::io::duplex(1024);
        let exchange = WsExchange {
            request: builder.body(()).unwrap().into_parts().0,
            socket: Some(Box::new(server)),
            head: Bytes::new(),
            options: ProxyOptions::default(),
            events: Arc::new(EventRegistry::new()),
            on_error: None,
        };
        (exchange, client)
    }

    #[tokio::test]
    async fn test_rejects_non_get_and_non_websocket() {
        let cases: [(&str, &[(&str, &str)]); 3] = [
            ("POST", &[("upgrade", "websocket")]),
            ("GET", &[]),
            ("GET", &[("upgrade", "h2c")]),
        ];

        for (method, headers) in cases {
            let (mut ex, mut client) = exchange(method, headers);
            assert!(check_method_and_header(&mut ex).await);
            assert!(ex.socket.is_none());

            let mut buf = Vec::new();
            assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_accepts_websocket_case_insensitively() {
        let (mut ex, _client) = exchange("GET", &[("upgrade", "WebSocket")]);
        assert!(!check_method_and_header(&mut ex).await);
        assert!(ex.socket.is_some());
    }

    #[tokio::test]
    async fn test_x_headers_use_ws_protocols() {
        let (mut ex, _client) = exchange("GET", &[("upgrade", "websocket"), ("host", "a.com:81")]);
        ex.options.xfwd = Some(true);
        x_headers(&mut ex).await;
        assert_eq!(ex.request.headers["x-forwarded-proto"], "ws");
        assert_eq!(ex.request.headers["x-forwarded-port"], "81");
    }

    #[test]
    fn test_header_block_repeats_multi_valued_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let block = String::from_utf8(header_block("HTTP/1.1 101 Switching Protocols", &headers))
            .unwrap();
        assert!(block.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(block.contains("upgrade: websocket\r\n"));
        assert!(block.contains("set-cookie: a=1\r\nset-cookie: b=2\r\n"));
        assert!(block.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_goes_to_callback_and_ends_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut ex, mut client) = exchange("GET", &[("upgrade", "websocket")]);
        ex.options = ProxyOptions::new(format!("ws://{}", addr).as_str());
        ex.options.resolve_targets().unwrap();

        let mut events = EventRegistry::new();
        let event_hits = Arc::new(Mutex::new(0));
        let counter = event_hits.clone();
        events.on(EventKind::Error, move |_| *counter.lock().unwrap() += 1);
        ex.events = Arc::new(events);

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        ex.on_error = Some(Arc::new(move |e: &ProxyError, _: &request::Parts| {
            *slot.lock().unwrap() = e.io_kind();
        }));

        assert!(stream(&mut ex).await);
        assert_eq!(*seen.lock().unwrap(), Some(io::ErrorKind::ConnectionRefused));
        assert_eq!(*event_hits.lock().unwrap(), 0);

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forward_only_options_go_to_error_event_not_callback() {
        let (mut ex, mut client) = exchange("GET", &[("upgrade", "websocket")]);
        ex.options = ProxyOptions {
            forward: Some("ws://127.0.0.1:9".into()),
            ..ProxyOptions::default()
        };
        ex.options.resolve_targets().unwrap();

        let mut events = EventRegistry::new();
        let event_hits = Arc::new(Mutex::new(0));
        let counter = event_hits.clone();
        events.on(EventKind::Error, move |_| *counter.lock().unwrap() += 1);
        ex.events = Arc::new(events);

        let callback_hits = Arc::new(Mutex::new(0));
        let counter = callback_hits.clone();
        ex.on_error = Some(Arc::new(move |_: &ProxyError, _: &request::Parts| {
            *counter.lock().unwrap() += 1;
        }));

        assert!(stream(&mut ex).await);
        assert_eq!(*callback_hits.lock().unwrap(), 0);
        assert_eq!(*event_hits.lock().unwrap(), 1);

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
