//! Listener for a `ProxyServer`: accepts connections, optionally through TLS,
//! and hands upgrade requests to the WebSocket pipeline and everything else
//! to the web pipeline.

use crate::error::ProxyError;
use crate::options::TlsMaterial;
use crate::proxy::{CallOptions, ProxyServer};
use crate::socket::{BoxSocket, ClientInfo, Rewind};
use bytes::BytesMut;
use http::header::UPGRADE;
use httparse::Status;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Version};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

/// hyper refuses read buffers smaller than this.
const MIN_READ_BUFFER: usize = 8192;

/// Matches hyper's default header limit.
const MAX_HEADERS: usize = 100;

/// Matches hyper's default `header_read_timeout`.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create TLS server configuration from PEM encoded certificate chain and key
pub fn create_tls_config(ssl: &TlsMaterial) -> Result<ServerConfig, ProxyError> {
    let cert_pem = ssl
        .cert
        .as_deref()
        .ok_or_else(|| ProxyError::Config("TLS listener requires a certificate".to_string()))?;
    let key_pem = ssl
        .key
        .as_deref()
        .ok_or_else(|| ProxyError::Config("TLS listener requires a private key".to_string()))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Config("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))
}

pub async fn serve(
    proxy: Arc<ProxyServer>,
    addr: SocketAddr,
    max_header_size: usize,
) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(&addr).await?;
    serve_listener(proxy, listener, max_header_size).await
}

/// Runs the accept loop on an already bound listener.
pub async fn serve_listener(
    proxy: Arc<ProxyServer>,
    listener: TcpListener,
    max_header_size: usize,
) -> Result<(), ProxyError> {
    let acceptor = match proxy.options().ssl.as_ref() {
        Some(ssl) if ssl.cert.is_some() && ssl.key.is_some() => {
            Some(TlsAcceptor::from(Arc::new(create_tls_config(ssl)?)))
        }
        _ => None,
    };

    let local_addr = listener.local_addr()?;
    match acceptor {
        Some(_) => info!("HTTPS proxy listening on: https://{}", local_addr),
        None => info!("HTTP proxy listening on: http://{}", local_addr),
    }

    loop {
        let (tcp_stream, remote_addr) = listener.accept().await?;
        let proxy = proxy.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let mut client = ClientInfo {
                remote_addr: Some(remote_addr),
                encrypted: false,
            };

            let socket: BoxSocket = match acceptor {
                Some(acceptor) => match acceptor.accept(tcp_stream).await {
                    Ok(tls_stream) => {
                        client.encrypted = true;
                        Box::new(tls_stream)
                    }
                    Err(e) => {
                        warn!("Error establishing TLS connection from {}: {}", remote_addr, e);
                        return;
                    }
                },
                None => Box::new(tcp_stream),
            };

            handle_connection(proxy, socket, client, max_header_size).await;
        });
    }
}

async fn handle_connection(
    proxy: Arc<ProxyServer>,
    mut socket: BoxSocket,
    client: ClientInfo,
    max_header_size: usize,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    let head = read_request_head(&mut socket, &mut buffer, max_header_size, HEAD_READ_TIMEOUT).await;

    let request = match head {
        RequestHead::Parsed { len, request } => Some((len, request)),
        RequestHead::Malformed => None,
        RequestHead::TooLarge => {
            warn!(
                "Request head from {:?} exceeds {} bytes",
                client.remote_addr, max_header_size
            );
            let _ = socket
                .write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\nconnection: close\r\n\r\n")
                .await;
            let _ = socket.shutdown().await;
            return;
        }
        RequestHead::TimedOut => {
            debug!("No request head from {:?} in time", client.remote_addr);
            let _ = socket.shutdown().await;
            return;
        }
        RequestHead::Closed => return,
    };

    if let Some((len, mut request)) = request {
        if proxy.options().ws_enabled() && request.headers().contains_key(UPGRADE) {
            request.extensions_mut().insert(client);
            let head = buffer.split_off(len).freeze();
            let call = CallOptions::default().with_head(head);
            proxy.ws(request, socket, call).await;
            return;
        }
    }

    // Malformed heads go to hyper as well, which answers them with a 400.
    let io = TokioIo::new(Rewind::new(buffer.freeze(), socket));
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        let client = client.clone();
        async move {
            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(client);
            let request = Request::from_parts(parts, body.boxed());
            Ok::<_, Infallible>(proxy.web(request, CallOptions::default()).await)
        }
    });

    if let Err(e) = ServerBuilder::new()
        .keep_alive(true)
        .preserve_header_case(true)
        .max_buf_size(max_header_size.max(MIN_READ_BUFFER))
        .serve_connection(io, service)
        .await
    {
        debug!("Error serving connection: {}", e);
    }
}

enum RequestHead {
    Parsed { len: usize, request: Request<()> },
    Malformed,
    TooLarge,
    TimedOut,
    Closed,
}

/// Reads from `socket` into `buffer` until a full request head has arrived.
/// Bytes past the head stay in `buffer`.
async fn read_request_head<S>(
    socket: &mut S,
    buffer: &mut BytesMut,
    max_header_size: usize,
    limit: Duration,
) -> RequestHead
where
    S: AsyncRead + Unpin,
{
    let read = async {
        loop {
            match parse_request_head(&buffer[..]) {
                Ok(Some((len, request))) => return RequestHead::Parsed { len, request },
                Ok(None) => {}
                Err(e) => {
                    debug!("Unparseable request head: {}", e);
                    return RequestHead::Malformed;
                }
            }
            if buffer.len() >= max_header_size {
                return RequestHead::TooLarge;
            }
            match socket.read_buf(&mut *buffer).await {
                Ok(0) => return RequestHead::Closed,
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read request head: {}", e);
                    return RequestHead::Closed;
                }
            }
        }
    };

    match tokio::time::timeout(limit, read).await {
        Ok(head) => head,
        Err(_) => RequestHead::TimedOut,
    }
}

/// Parses an HTTP/1.x request head at the start of `buffer`.
///
/// Returns the head length and the request, or `None` while the head is
/// still incomplete.
fn parse_request_head(buffer: &[u8]) -> Result<Option<(usize, Request<()>)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let len = match parsed.parse(buffer) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::Http(format!("Invalid request head: {}", e))),
    };

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or_default())
        .uri(parsed.path.unwrap_or_default())
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let request = builder
        .body(())
        .map_err(|e| ProxyError::Http(format!("Invalid request head: {}", e)))?;
    Ok(Some((len, request)))
}
